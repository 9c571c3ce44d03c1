//! imap-snapshot-mcp: IMAP MCP server over stdio
//!
//! Serves IMAP mailboxes via the Model Context Protocol (MCP) over stdio.
//! Message ids and search cursors are tied to the mailbox UIDVALIDITY they
//! were issued under, and every follow-up call re-checks it before touching
//! a UID.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven configuration for accounts and server settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`server`]: MCP tool handlers with validation and business orchestration
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`headers`]: Curated header parsing for summaries and message details
//! - [`search_query`]: Search input validation and `UID SEARCH` criteria
//! - [`message_id`]: Stable, opaque message ID parse/encode logic
//! - [`uid_set`]: Range-compressed UID sets and page slicing
//! - [`pagination`]: Cursor storage with TTL and eviction behavior
//! - [`snapshot`]: Per-mailbox locking with UIDVALIDITY verification

mod config;
mod errors;
mod headers;
mod imap;
mod message_id;
mod models;
mod pagination;
mod search_query;
mod server;
mod snapshot;
mod uid_set;

use std::path::PathBuf;

use clap::Parser;
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imap-snapshot-mcp", version)]
struct Cli {
    /// Load environment variables from this file instead of `./.env`
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,
}

/// Application entry point
///
/// Loads env, initializes tracing, loads config, and serves the MCP server
/// over stdio. This process expects to be spawned by an MCP client via
/// `stdio` transport, so logs go to stderr.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_DEFAULT_HOST=imap.example.com \
/// MAIL_IMAP_DEFAULT_USER=user@example.com \
/// MAIL_IMAP_DEFAULT_PASS=secret \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::load_from_env()?;
    info!(
        accounts = config.accounts.len(),
        write_enabled = config.write_enabled,
        "starting MCP server on stdio"
    );
    let service = server::MailImapServer::new(config).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
