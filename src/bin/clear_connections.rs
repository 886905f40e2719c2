//! Administrative sweep that deletes stored connections so users re-link
//! their tools. Run after rotating the encryption key: rows encrypted under
//! the old key can no longer be decrypted, and this tool never tries — it
//! deletes row by row regardless of ciphertext state.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use integrations::{
    config::ConfigLoader,
    db,
    store::{ConnectionStore, DatabaseStore},
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "clear_connections",
    about = "Delete stored tool connections so users re-authorize"
)]
struct Args {
    /// Restrict the sweep to a single user
    #[arg(long)]
    user: Option<Uuid>,

    /// List what would be deleted without deleting anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loader = ConfigLoader::new();
    let config = loader.load().context("loading configuration")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    let store = DatabaseStore::new(Arc::new(db));

    let rows = match args.user {
        Some(user_id) => store
            .list_connections(user_id)
            .await
            .context("listing connections for user")?,
        None => store
            .list_all_connections()
            .await
            .context("listing connections")?,
    };

    if args.dry_run {
        for row in &rows {
            println!("would delete: user={} tool={}", row.user_id, row.tool_id);
        }
        println!("{} connection(s) would be deleted.", rows.len());
        return Ok(());
    }

    let mut deleted_count = 0usize;
    for row in rows {
        let removed = store
            .delete_connection(row.user_id, &row.tool_id)
            .await
            .with_context(|| {
                format!("deleting connection user={} tool={}", row.user_id, row.tool_id)
            })?;
        if removed {
            deleted_count += 1;
        }
    }

    println!("Deleted {} connection(s).", deleted_count);

    Ok(())
}
