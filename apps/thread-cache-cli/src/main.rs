mod cli;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use thread_cache::{
    metrics, CacheConfig, InMemoryBackend, LogEntry, Role, StoreBackend, SyncEngine,
};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let mut config = CacheConfig::from_env();
    if let Some(url) = cli.redis_url.clone() {
        config.backend = StoreBackend::Redis;
        config.redis_url = Some(url);
    }
    if let Some(process_id) = cli.process_id.clone() {
        config.process_id = process_id;
    }
    if config.backend == StoreBackend::InMemory {
        warn!("no REDIS_URL configured; state lives only for this invocation");
    }

    let backend = Arc::new(InMemoryBackend::new());
    if let Commands::Seed {
        thread,
        file,
        synthetic,
        ..
    } = &cli.command
    {
        let entries = match (file, synthetic) {
            (Some(path), _) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<Vec<LogEntry>>(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            (None, Some(count)) => synthetic_entries(thread, *count),
            (None, None) => anyhow::bail!("seed needs --file or --synthetic"),
        };
        backend.insert_messages(thread, entries);
    }

    let engine = SyncEngine::connect(config, backend).await;
    info!(process = %engine.process_id(), "engine ready");
    run(engine, cli.command).await
}

async fn run(engine: SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Seed { thread, force, .. } => {
            let outcome = engine.seed_thread(&thread, force).await?;
            println!("{outcome:?}");
        }
        Commands::Viewport { thread, anchor } => {
            print_json(&engine.get_viewport(&thread, anchor.into()).await)?;
        }
        Commands::LoadMore {
            thread,
            direction,
            cursor,
        } => {
            // Page relative to the window a UI would already hold.
            engine.get_viewport(&thread, thread_cache::Anchor::Bottom).await;
            print_json(&engine.load_more(&thread, direction.into(), &cursor).await)?;
        }
        Commands::Expand {
            thread,
            anchor_ts,
            direction,
        } => {
            print_json(
                &engine
                    .expand_viewport(&thread, anchor_ts, direction.into())
                    .await,
            )?;
        }
        Commands::Lock {
            resource,
            ttl_ms,
            release,
        } => {
            let ok = if release {
                engine.release(&resource).await
            } else {
                engine
                    .acquire(&resource, ttl_ms.map(Duration::from_millis))
                    .await
            };
            let holder = engine.locks().holder(&resource).await;
            print_json(&serde_json::json!({
                "resource": resource,
                "ok": ok,
                "holder": holder,
            }))?;
        }
        Commands::Presence {
            thread,
            member,
            leave,
        } => {
            if let Some(member) = member {
                if leave {
                    engine.leave(&thread, &member).await?;
                } else {
                    engine.heartbeat(&thread, &member).await?;
                }
            }
            print_json(&engine.active_members(&thread).await)?;
        }
        Commands::Watch { thread, seconds } => {
            let channel = thread_cache::keys::thread_channel(&thread);
            let printer = engine
                .notifier()
                .subscribe(&channel, |event| match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "unprintable event"),
                })
                .await?;
            match seconds {
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                None => {
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for ctrl-c")?;
                }
            }
            printer.abort();
        }
        Commands::Metrics => {
            print!("{}", String::from_utf8_lossy(&metrics::gather()));
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn synthetic_entries(thread: &str, count: usize) -> Vec<LogEntry> {
    (0..count)
        .map(|i| {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            LogEntry::new(
                format!("msg_{i}"),
                thread,
                role,
                format!("synthetic message {i}"),
                1_000 + i as i64,
            )
        })
        .collect()
}
