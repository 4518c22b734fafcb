//! Rivulet - command-line access to a journal-backed data directory
//!
//! Every command opens the directory, replays the journal, performs one
//! operation and prints its result as JSON lines on stdout. Logs go to
//! stderr.

mod args;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use args::{Cli, Command};
use rivulet_broker::{Broker, BrokerConfig, ReadOptions};
use rivulet_core::{Fields, StreamId, SystemClock};
use rivulet_logging::{LogConfig, RivuletSubscriberBuilder};
use rivulet_storage::{GroupStart, PendingQuery, TrimStrategy};

const DEFAULT_DATA_DIR: &str = "./rivulet-data";

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Parse `name=value` pairs in order
fn parse_fields(pairs: &[String]) -> anyhow::Result<Fields> {
    let mut fields = Fields::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("Field must be name=value, got {pair:?}");
        };
        fields.push(name, value);
    }
    Ok(fields)
}

fn parse_group_start(s: &str) -> anyhow::Result<GroupStart> {
    Ok(match s {
        "$" => GroupStart::Latest,
        "0" | "-" => GroupStart::Beginning,
        _ => GroupStart::At(s.parse()?),
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<BrokerConfig> {
    let mut config: BrokerConfig = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => BrokerConfig::default(),
    };
    config.data_dir = Some(
        cli.data_dir
            .clone()
            .or(config.data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _guard = RivuletSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .with_level(if cli.verbose { "debug" } else { "warn" })
        .with_stderr()
        .init()?;

    let config = load_config(&cli)?;
    debug!(data_dir = ?config.data_dir, "Opening broker");
    let broker = Broker::open(config, Arc::new(SystemClock)).await?;

    run(&broker, cli.command).await?;
    broker.flush().await?;
    Ok(())
}

async fn run(broker: &Broker, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Append { stream, fields, id } => {
            let id = broker
                .append_with_id(&stream, id, parse_fields(&fields)?)
                .await?;
            emit(&id)?;
        }
        Command::Range {
            stream,
            start,
            end,
            count,
        } => {
            let start = StreamId::parse_start(&start)?;
            let end = StreamId::parse_end(&end)?;
            for entry in broker.range_forward(&stream, start, end, count).await? {
                emit(&entry)?;
            }
        }
        Command::RevRange {
            stream,
            end,
            start,
            count,
        } => {
            let end = StreamId::parse_end(&end)?;
            let start = StreamId::parse_start(&start)?;
            for entry in broker.range_backward(&stream, end, start, count).await? {
                emit(&entry)?;
            }
        }
        Command::Info { stream } => {
            let info = broker.info(&stream).await?;
            let groups = broker.groups(&stream).await?;
            emit(&json!({ "info": info, "groups": groups }))?;
        }
        Command::CreateGroup {
            stream,
            group,
            start,
            mkstream,
        } => {
            let created = broker
                .ensure_group(&stream, &group, parse_group_start(&start)?, mkstream)
                .await?;
            emit(&json!({ "created": created }))?;
        }
        Command::Read {
            stream,
            group,
            consumer,
            count,
            block_ms,
        } => {
            let mut options = ReadOptions::new();
            if let Some(count) = count {
                options = options.count(count);
            }
            if let Some(ms) = block_ms {
                options = options.block(Duration::from_millis(ms));
            }
            for entry in broker.read_new(&stream, &group, &consumer, options).await? {
                emit(&entry)?;
            }
        }
        Command::Pending {
            stream,
            group,
            detail,
            start,
            end,
            count,
            consumer,
            min_idle_ms,
        } => {
            if !detail {
                emit(&broker.pending(&stream, &group).await?)?;
                return Ok(());
            }
            let mut query = PendingQuery::new().range(
                StreamId::parse_start(&start)?,
                StreamId::parse_end(&end)?,
            );
            if let Some(n) = count {
                query = query.limit(n);
            }
            if let Some(consumer) = consumer {
                query = query.consumer(consumer);
            }
            if let Some(ms) = min_idle_ms {
                query = query.min_idle(Duration::from_millis(ms));
            }
            let now = broker.now_ms();
            for record in broker.list_pending(&stream, &group, &query).await? {
                emit(&json!({
                    "id": record.entry_id,
                    "owner": record.owner,
                    "delivery_count": record.delivery_count,
                    "idle_ms": now.saturating_sub(record.last_delivery_ms),
                }))?;
            }
        }
        Command::Claim {
            stream,
            group,
            consumer,
            min_idle_ms,
            ids,
        } => {
            let result = broker
                .claim(
                    &stream,
                    &group,
                    &consumer,
                    Duration::from_millis(min_idle_ms),
                    &ids,
                )
                .await?;
            emit(&result)?;
        }
        Command::AutoClaim {
            stream,
            group,
            consumer,
            min_idle_ms,
            cursor,
            count,
        } => {
            let result = broker
                .auto_claim(
                    &stream,
                    &group,
                    &consumer,
                    Duration::from_millis(min_idle_ms),
                    cursor,
                    count,
                )
                .await?;
            emit(&result)?;
        }
        Command::Ack { stream, group, ids } => {
            let acked = broker.ack(&stream, &group, &ids).await?;
            emit(&json!({ "acked": acked }))?;
        }
        Command::Trim {
            stream,
            maxlen,
            minid,
        } => {
            let strategy = match (maxlen, minid) {
                (Some(n), None) => TrimStrategy::MaxLen(n),
                (None, Some(id)) => TrimStrategy::MinId(id),
                _ => bail!("Exactly one of --maxlen and --minid is required"),
            };
            let removed = broker.trim(&stream, strategy).await?;
            emit(&json!({ "removed": removed }))?;
        }
        Command::Compact => {
            let records = broker.compact().await?;
            emit(&json!({ "records": records }))?;
        }
    }
    Ok(())
}
