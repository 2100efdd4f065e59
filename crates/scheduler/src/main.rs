use std::sync::Arc;
use std::time::Duration;

use digest_common::config::AppConfig;
use digest_common::db;
use digest_scheduler::wiring;
use digest_scheduler::{DigestScheduler, TriggerOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "digest_scheduler=info,digest_engine=info,digest_fetcher=info,digest_notifier=info"
                    .into()
            }),
        )
        .json()
        .init();

    tracing::info!("Digest scheduler starting...");

    let config = AppConfig::from_env()?;
    let pool = db::create_pool(&config).await?;

    let processor = Arc::new(wiring::build_processor(&config, pool)?);
    let mut scheduler = DigestScheduler::new(
        processor,
        Duration::from_secs(config.tick_interval_secs),
        config.max_concurrency,
    );

    // `digest-scheduler run <query_id>` runs one cycle and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, query_id] = args.as_slice()
        && command == "run"
    {
        let query_id: i64 = query_id
            .parse()
            .map_err(|_| anyhow::anyhow!("query id must be an integer, got '{}'", query_id))?;

        match scheduler.trigger(query_id).await? {
            TriggerOutcome::Started => scheduler.wait_idle().await,
            TriggerOutcome::Skipped => tracing::warn!(query_id, "Query already running"),
            TriggerOutcome::NotFound => anyhow::bail!("query {} not found", query_id),
        }
        return Ok(());
    }

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduler exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    scheduler.shutdown().await;
    tracing::info!("Digest scheduler stopped.");
    Ok(())
}
