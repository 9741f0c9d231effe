use clap::Parser;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use queue_etl::feed::InMemoryChangeFeed;
use queue_etl::publisher::{DefaultPublisherFactory, InMemoryPublisherFactory, PublishLog, PublisherFactory};
use queue_etl::runner::TaskStatus;
use queue_etl::types::Offset;
use queue_etl::{Config, EtlAdmin, EtlError, Result};

#[derive(Parser)]
#[command(name = "queue-etl-replay")]
#[command(about = "Replays recorded document changes through the configured queue ETL tasks")]
#[command(version)]
struct Cli {
    /// TOML file with connection strings and ETL tasks
    #[arg(long)]
    config: String,

    /// JSON lines file, one change per line
    #[arg(long)]
    events: String,

    /// Print the messages instead of sending them to the brokers
    #[arg(long)]
    dry_run: bool,

    /// Give up waiting for the tasks after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
}

/// One recorded change. A missing `document` is a delete.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    collection: String,
    id: String,
    #[serde(default)]
    document: Option<serde_json::Value>,
}

fn load_events(path: &str, feed: &InMemoryChangeFeed) -> Result<Vec<(String, Offset)>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut appended = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = serde_json::from_str(&line).map_err(|e| {
            EtlError::Config(format!("{}:{}: invalid change record: {}", path, index + 1, e))
        })?;
        let offset = match record.document {
            Some(document) => feed.put(record.collection.clone(), record.id, document),
            None => feed.delete(record.collection.clone(), record.id),
        };
        appended.push((record.collection, offset));
    }
    Ok(appended)
}

/// Last offset each task has to checkpoint before the replay is complete.
fn target_offset(config: &Config, task: &str, events: &[(String, Offset)]) -> Option<Offset> {
    let task = config.tasks.iter().find(|t| t.name == task && !t.disabled)?;
    let collections = task.collections();
    let all = task.applies_to_all_documents();
    events
        .iter()
        .filter(|(collection, _)| all || collections.contains(collection))
        .map(|(_, offset)| *offset)
        .max()
}

fn is_done(status: &TaskStatus, target: Option<Offset>) -> bool {
    status.state.is_terminal()
        || target.map_or(true, |target| status.last_checkpoint.map_or(false, |c| c >= target))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    config.validate()?;
    info!(
        "Loaded {} connection string(s) and {} task(s) from {}",
        config.connection_strings.len(),
        config.tasks.len(),
        cli.config
    );

    let feed = InMemoryChangeFeed::new();
    let events = load_events(&cli.events, &feed)?;
    info!("Loaded {} change(s) from {}", events.len(), cli.events);

    let log = PublishLog::new();
    let publishers: Arc<dyn PublisherFactory> = if cli.dry_run {
        Arc::new(InMemoryPublisherFactory::new(log.clone()))
    } else {
        Arc::new(DefaultPublisherFactory::new(config.runner.publish_timeout_ms))
    };

    let admin = EtlAdmin::from_config(&config, Arc::new(feed), publishers).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.timeout_secs);
    loop {
        let statuses = admin.list_tasks();
        let pending: Vec<&TaskStatus> = statuses
            .iter()
            .filter(|status| !is_done(status, target_offset(&config, &status.name, &events)))
            .collect();
        if pending.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Timed out waiting for {} task(s)", pending.len());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    admin.shutdown().await;

    let mut failed = false;
    for status in admin.list_tasks() {
        match &status.last_error {
            Some(cause) => {
                failed = true;
                error!("Task '{}' {}: {}", status.name, status.state, cause);
            }
            None => info!(
                "Task '{}' {}: {} event(s), {} message(s), {} transform failure(s)",
                status.name,
                status.state,
                status.events_processed,
                status.messages_published,
                status.transform_failures
            ),
        }
    }

    if cli.dry_run {
        for message in log.messages() {
            let line = serde_json::json!({
                "destination": message.destination,
                "key": message.key,
                "partition_key": message.partition_key,
                "routing_key": message.routing_key,
                "headers": message.headers,
                "body": String::from_utf8_lossy(&message.body),
            });
            println!("{line}");
        }
    }

    if failed {
        return Err(EtlError::InvalidState("one or more ETL tasks faulted".to_string()));
    }
    Ok(())
}
