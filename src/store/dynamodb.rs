//! DynamoDB-backed lock store and table control plane.
//!
//! The data-plane adapter maps the four [`LockStore`] operations onto
//! single-item conditional writes: `attribute_not_exists(lockKey)` guards a
//! fresh acquire, `versionNumber = :expected` guards refresh, steal, and
//! release. DynamoDB evaluates a condition expression against a missing item
//! as failed, which is exactly the absence semantics the protocol wants.
//!
//! [`TableControl`] is the control plane used by the admin binary and by
//! integration setups: create, destroy, and list lock tables. The lock
//! protocol itself never provisions tables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client;
use tracing::debug;

use crate::error::{ConflictSnafu, StoreError, TransientSnafu};
use crate::store::{LockRecord, LockStore};

const ATTR_KEY: &str = "lockKey";
const ATTR_LEASE: &str = "leaseDuration";
const ATTR_VERSION: &str = "versionNumber";
const ATTR_HOST: &str = "hostIdentifier";

const CONDITION_ABSENT: &str = "attribute_not_exists(lockKey)";
const CONDITION_VERSION: &str = "versionNumber = :expected";

/// Total send attempts per operation; only transport-level failures consume
/// the budget, conditional conflicts return immediately.
const TRANSPORT_ATTEMPTS: u32 = 3;

fn is_transport_error<E, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_)
    )
}

/// [`LockStore`] implementation bound to one DynamoDB table.
///
/// Credentials and region come from the client, which the caller builds from
/// the ambient environment ([`DynamoLockStore::from_env`]) or injects.
pub struct DynamoLockStore {
    client: Client,
    table: String,
}

impl DynamoLockStore {
    /// Bind an existing client to `table`.
    pub fn new(client: Client, table: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client,
            table: table.into(),
        })
    }

    /// Build a client from the ambient AWS environment (profile, environment
    /// variables, instance metadata) and bind it to `table`.
    pub async fn from_env(table: impl Into<String>) -> Arc<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table)
    }

    fn item_for(&self, key: &str, record: &LockRecord) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_KEY.to_string(), AttributeValue::S(key.to_string())),
            (
                ATTR_LEASE.to_string(),
                AttributeValue::N(record.lease_duration.to_string()),
            ),
            (
                ATTR_VERSION.to_string(),
                AttributeValue::S(record.version_number.clone()),
            ),
            (
                ATTR_HOST.to_string(),
                AttributeValue::S(record.host_identifier.clone()),
            ),
        ])
    }

    async fn conditional_put(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let item = self.item_for(key, &record);
        let mut attempts = 0u32;
        loop {
            let mut request = self
                .client
                .put_item()
                .table_name(&self.table)
                .set_item(Some(item.clone()));
            request = match expected_version {
                Some(version) => request
                    .condition_expression(CONDITION_VERSION)
                    .expression_attribute_values(":expected", AttributeValue::S(version.to_string())),
                None => request.condition_expression(CONDITION_ABSENT),
            };

            let err = match request.send().await {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            if matches!(err.as_service_error(), Some(service) if service.is_conditional_check_failed_exception())
            {
                return ConflictSnafu { key }.fail();
            }
            attempts += 1;
            if is_transport_error(&err) && attempts < TRANSPORT_ATTEMPTS {
                debug!(key, table = %self.table, attempt = attempts, "retrying put after transport failure");
                continue;
            }
            return TransientSnafu { message: err.to_string() }.fail();
        }
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn put_if_absent(&self, key: &str, record: LockRecord) -> Result<(), StoreError> {
        self.conditional_put(key, record, None).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> Result<(), StoreError> {
        self.conditional_put(key, record, Some(expected_version)).await
    }

    async fn delete_if_version(&self, key: &str, expected_version: &str) -> Result<(), StoreError> {
        let mut attempts = 0u32;
        loop {
            let err = match self
                .client
                .delete_item()
                .table_name(&self.table)
                .key(ATTR_KEY, AttributeValue::S(key.to_string()))
                .condition_expression(CONDITION_VERSION)
                .expression_attribute_values(
                    ":expected",
                    AttributeValue::S(expected_version.to_string()),
                )
                .send()
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            if matches!(err.as_service_error(), Some(service) if service.is_conditional_check_failed_exception())
            {
                return ConflictSnafu { key }.fail();
            }
            attempts += 1;
            if is_transport_error(&err) && attempts < TRANSPORT_ATTEMPTS {
                debug!(key, table = %self.table, attempt = attempts, "retrying delete after transport failure");
                continue;
            }
            return TransientSnafu { message: err.to_string() }.fail();
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let mut attempts = 0u32;
        loop {
            let err = match self
                .client
                .get_item()
                .table_name(&self.table)
                .key(ATTR_KEY, AttributeValue::S(key.to_string()))
                .consistent_read(true)
                .send()
                .await
            {
                Ok(output) => {
                    return match output.item() {
                        Some(item) => record_from_item(key, item).map(Some),
                        None => Ok(None),
                    };
                }
                Err(err) => err,
            };
            attempts += 1;
            if is_transport_error(&err) && attempts < TRANSPORT_ATTEMPTS {
                debug!(key, table = %self.table, attempt = attempts, "retrying read after transport failure");
                continue;
            }
            return TransientSnafu { message: err.to_string() }.fail();
        }
    }
}

fn record_from_item(
    key: &str,
    item: &HashMap<String, AttributeValue>,
) -> Result<LockRecord, StoreError> {
    let lease = item
        .get(ATTR_LEASE)
        .and_then(|value| value.as_n().ok())
        .and_then(|number| number.parse::<u64>().ok());
    let version = item.get(ATTR_VERSION).and_then(|value| value.as_s().ok());
    let host = item.get(ATTR_HOST).and_then(|value| value.as_s().ok());
    match (lease, version, host) {
        (Some(lease_duration), Some(version_number), Some(host_identifier)) => Ok(LockRecord {
            lease_duration,
            version_number: version_number.clone(),
            host_identifier: host_identifier.clone(),
        }),
        _ => TransientSnafu {
            message: format!("malformed lock record for key '{key}'"),
        }
        .fail(),
    }
}

/// Control plane for lock tables: create, destroy, inspect.
///
/// Separate from [`DynamoLockStore`] because table lifecycle is an
/// administrative concern; the lock protocol assumes its table exists.
pub struct TableControl {
    client: Client,
}

impl TableControl {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS environment.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }

    /// Create a lock table and wait for it to become active.
    ///
    /// Returns `true` if the table was created, `false` if it already
    /// existed.
    pub async fn create(&self, table: &str) -> Result<bool, StoreError> {
        let key_attribute = AttributeDefinition::builder()
            .attribute_name(ATTR_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|err| StoreError::Transient { message: err.to_string() })?;
        let key_schema = KeySchemaElement::builder()
            .attribute_name(ATTR_KEY)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|err| StoreError::Transient { message: err.to_string() })?;

        let result = self
            .client
            .create_table()
            .table_name(table)
            .attribute_definitions(key_attribute)
            .key_schema(key_schema)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;
        match result {
            Ok(_) => {
                self.wait_until_active(table).await?;
                Ok(true)
            }
            Err(err)
                if matches!(err.as_service_error(), Some(service) if service.is_resource_in_use_exception()) =>
            {
                Ok(false)
            }
            Err(err) => TransientSnafu { message: err.to_string() }.fail(),
        }
    }

    /// Delete a lock table.
    ///
    /// Returns `true` if the table was deleted, `false` if it did not exist.
    /// A table still being created is retried until DynamoDB accepts the
    /// deletion.
    pub async fn destroy(&self, table: &str) -> Result<bool, StoreError> {
        let mut attempts = 0u32;
        loop {
            let err = match self.client.delete_table().table_name(table).send().await {
                Ok(_) => return Ok(true),
                Err(err) => err,
            };
            match err.as_service_error() {
                Some(service) if service.is_resource_not_found_exception() => return Ok(false),
                Some(service) if service.is_resource_in_use_exception() => {
                    attempts += 1;
                    if attempts >= 30 {
                        return TransientSnafu {
                            message: format!("table '{table}' stayed busy during deletion"),
                        }
                        .fail();
                    }
                    debug!(table, attempt = attempts, "table busy, retrying deletion");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => return TransientSnafu { message: err.to_string() }.fail(),
            }
        }
    }

    /// Whether a table with this name exists (in any status).
    pub async fn exists(&self, table: &str) -> Result<bool, StoreError> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(err.as_service_error(), Some(service) if service.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(err) => TransientSnafu { message: err.to_string() }.fail(),
        }
    }

    /// All table names visible to these credentials.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut start_from = None;
        loop {
            let output = self
                .client
                .list_tables()
                .set_exclusive_start_table_name(start_from)
                .send()
                .await
                .map_err(|err| StoreError::Transient { message: err.to_string() })?;
            names.extend(output.table_names().iter().cloned());
            match output.last_evaluated_table_name() {
                Some(next) => start_from = Some(next.to_string()),
                None => return Ok(names),
            }
        }
    }

    async fn wait_until_active(&self, table: &str) -> Result<(), StoreError> {
        for _ in 0..120 {
            let output = self
                .client
                .describe_table()
                .table_name(table)
                .send()
                .await
                .map_err(|err| StoreError::Transient { message: err.to_string() })?;
            let status = output.table().and_then(|description| description.table_status());
            if status == Some(&TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        TransientSnafu {
            message: format!("table '{table}' did not become active"),
        }
        .fail()
    }
}
