//! Administrative CLI for leasehold lock tables.
//!
//! Manages the DynamoDB tables that back lock sessions; the lock protocol
//! itself never provisions storage. Credentials and region are resolved from
//! the ambient AWS environment.
//!
//! Exit codes follow the usual administrative conventions: `create-table`
//! succeeds when the table was created or already existed, `delete-table`
//! succeeds when the table was deleted or never existed, and any store
//! failure exits non-zero.
//!
//! ```bash
//! leasehold-admin create-table team-locks
//! leasehold-admin list-tables
//! leasehold-admin delete-table team-locks
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use leasehold::TableControl;

#[derive(Parser)]
#[command(name = "leasehold-admin", version, about = "Manage leasehold lock tables")]
struct Cli {
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Create a lock table (succeeds if it already exists).
    CreateTable {
        /// Table name.
        name: String,
    },

    /// Delete a lock table (succeeds if it does not exist).
    DeleteTable {
        /// Table name.
        name: String,
    },

    /// List tables, one name per line.
    ListTables,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let control = TableControl::from_env().await;

    match cli.command {
        AdminCommand::CreateTable { name } => {
            let created = control
                .create(&name)
                .await
                .with_context(|| format!("creating table '{name}'"))?;
            if created {
                println!("created table '{name}'");
            } else {
                println!("table '{name}' already exists");
            }
        }
        AdminCommand::DeleteTable { name } => {
            let deleted = control
                .destroy(&name)
                .await
                .with_context(|| format!("deleting table '{name}'"))?;
            if deleted {
                println!("deleted table '{name}'");
            } else {
                println!("table '{name}' does not exist");
            }
        }
        AdminCommand::ListTables => {
            for name in control.list().await.context("listing tables")? {
                println!("{name}");
            }
        }
    }
    Ok(())
}
