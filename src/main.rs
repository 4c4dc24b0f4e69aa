use std::env;
use std::sync::Arc;

use anyhow::Context;
use requisition_router::csv::{read_actions, read_directory, write_results};
use requisition_router::memory::{LogNotifier, LogPush, MemoryDirectory, MemoryStore};
use requisition_router::status::spawn_janitor;
use requisition_router::{Batch, Config, Policy, ProgressTracker, Router, StatusStore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: requisition-router <directory.csv> <actions.csv>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let directory_path = args.next().context(USAGE)?;
    let actions_path = args.next().context(USAGE)?;

    for path in [&directory_path, &actions_path] {
        if !path.ends_with(".csv") {
            warn!(path, "input file seems to not be a csv file");
        }
    }

    let config = Config::from_env()?;
    let directory = MemoryDirectory::new(read_directory(&directory_path)?);

    let mut router = Router::new(
        Policy::new(config.policy.clone()),
        Arc::new(directory),
        Arc::new(MemoryStore::new()),
        Arc::new(LogNotifier),
    )
    .with_retry(config.retry);

    // status flags are advisory; routing still runs without them
    let janitor = match StatusStore::open(&config.status_path) {
        Ok(store) => {
            let store = Arc::new(store);
            router = router.with_status_store(store.clone());
            Some(spawn_janitor(store, config.janitor_interval, config.idle_reset))
        }
        Err(e) => {
            warn!(reason = %e, "status store unavailable");
            None
        }
    };

    let mut batch = Batch::new(router, ProgressTracker::new(Arc::new(LogPush)));
    let rows = read_actions(actions_path)?;
    let (row_sender, row_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in rows {
            match result {
                Ok(row) => {
                    if row_sender.send(row).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    batch.run(ReceiverStream::new(row_receiver)).await;

    if let Some(janitor) = janitor {
        janitor.abort();
    }

    write_results(std::io::stdout().lock(), batch.into_outcomes())?;
    Ok(())
}
