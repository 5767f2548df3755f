//! Operational CLI for cardsink
//!
//! Manages webhook subscriptions with the source platform and creates the
//! analytical store tables. Not part of the ingestion hot path.
//!
//! **Usage:**
//! ```bash
//! cardsink-admin register --board-id <id> [--callback-url <url>]
//! cardsink-admin list
//! cardsink-admin delete <webhook-id>
//! cardsink-admin create-tables
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cardsink::config::Settings;
use cardsink::db;
use cardsink::services::BoardClient;

#[derive(Parser, Debug)]
#[command(name = "cardsink-admin")]
#[command(about = "Manage webhook subscriptions and store tables")]
struct Args {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a webhook subscription for a board
    Register {
        /// Board id to subscribe to
        #[arg(long)]
        board_id: String,
        /// Callback URL (defaults to the configured one)
        #[arg(long)]
        callback_url: Option<String>,
        /// Optional description for the subscription
        #[arg(long)]
        description: Option<String>,
    },
    /// List webhook subscriptions for the current token
    List,
    /// Delete a webhook subscription by id
    Delete { webhook_id: String },
    /// Create the five analytical store tables
    CreateTables,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    match args.command {
        Command::Register {
            board_id,
            callback_url,
            description,
        } => {
            let callback = match callback_url.or_else(|| {
                (!settings.source.callback_url.is_empty())
                    .then(|| settings.source.callback_url.clone())
            }) {
                Some(url) => url,
                None => bail!("callback URL required: pass --callback-url or configure [source] callback_url"),
            };
            let client = BoardClient::new(&settings.source)?;
            let subscription = client
                .register_webhook(&board_id, &callback, description.as_deref())
                .await
                .context("webhook registration failed")?;
            println!(
                "Registered webhook {} -> {}",
                subscription.id,
                subscription.callback_url.as_deref().unwrap_or(&callback)
            );
        }
        Command::List => {
            let client = BoardClient::new(&settings.source)?;
            let subscriptions = client.list_webhooks().await.context("webhook listing failed")?;
            if subscriptions.is_empty() {
                println!("No webhook subscriptions registered");
            }
            for hook in subscriptions {
                println!(
                    "{} | active={} | model={} | callback={}",
                    hook.id,
                    hook.active.map(|a| a.to_string()).unwrap_or_default(),
                    hook.id_model.as_deref().unwrap_or("-"),
                    hook.callback_url.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Delete { webhook_id } => {
            let client = BoardClient::new(&settings.source)?;
            client
                .delete_webhook(&webhook_id)
                .await
                .context("webhook deletion failed")?;
            println!("Deleted webhook {webhook_id}");
        }
        Command::CreateTables => {
            let pool = db::init_store_pool(&settings.store.database_path).await?;
            db::schema::create_tables(&pool).await?;
            println!(
                "Tables ready in {}",
                settings.store.database_path.display()
            );
        }
    }

    Ok(())
}
