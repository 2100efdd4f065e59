use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use digest_common::error::DigestError;
use digest_common::types::QueryJob;
use digest_engine::DigestProcessor;

use crate::inflight::InFlight;

/// Result of a manual [`DigestScheduler::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// The query's previous cycle is still running.
    Skipped,
    NotFound,
}

/// Drives digest cycles on a fixed global interval.
///
/// Each tick loads the active queries and spawns one task per query. A query
/// whose previous cycle is still in flight is skipped for that tick, never
/// queued. A query blocked by a non-retryable failure is not scheduled; a
/// manual [`trigger`](Self::trigger) still runs it. Concurrency across queries is bounded by a semaphore; tasks wait
/// for a permit themselves so the tick loop never blocks on it.
pub struct DigestScheduler {
    processor: Arc<DigestProcessor>,
    tick_interval: Duration,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    tasks: JoinSet<()>,
}

impl DigestScheduler {
    pub fn new(
        processor: Arc<DigestProcessor>,
        tick_interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            processor,
            tick_interval,
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            in_flight: InFlight::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run until the surrounding task is cancelled.
    ///
    /// The first tick fires immediately. A tick that fails to load queries is
    /// logged and the loop carries on.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            max_concurrency = self.max_concurrency,
            "Digest scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_task_exit(result);
                }
            }
        }
    }

    /// Spawn a cycle for every active query not already in flight.
    /// Returns how many cycles were started.
    pub async fn tick(&mut self) -> Result<usize, DigestError> {
        self.reap_finished();

        let jobs = self.processor.store().active_queries().await?;
        let total = jobs.len();
        let mut started = 0;
        let mut blocked = 0;

        for job in jobs {
            if job.query.is_blocked() {
                tracing::debug!(
                    query_id = job.query.id,
                    status = ?job.query.last_status,
                    "Query blocked, skipping"
                );
                blocked += 1;
            } else if self.spawn_cycle(job) {
                started += 1;
            }
        }

        tracing::info!(
            queries = total,
            started,
            blocked,
            skipped = total - started - blocked,
            in_flight = self.in_flight.len(),
            "Scheduler tick"
        );
        Ok(started)
    }

    /// Start a cycle for one query now, outside the tick schedule.
    pub async fn trigger(&mut self, query_id: i64) -> Result<TriggerOutcome, DigestError> {
        if self.in_flight.contains(query_id) {
            return Ok(TriggerOutcome::Skipped);
        }

        let Some(job) = self.processor.store().load_query(query_id).await? else {
            return Ok(TriggerOutcome::NotFound);
        };

        if self.spawn_cycle(job) {
            tracing::info!(query_id, "Manual cycle triggered");
            Ok(TriggerOutcome::Started)
        } else {
            Ok(TriggerOutcome::Skipped)
        }
    }

    /// Wait for every spawned cycle to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            log_task_exit(result);
        }
    }

    /// Abort all in-flight cycles and wait for them to unwind.
    ///
    /// An aborted cycle has not written its snapshot, so it runs again in
    /// full on the next start.
    pub async fn shutdown(&mut self) {
        let running = self.tasks.len();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        tracing::info!(aborted = running, "Digest scheduler stopped");
    }

    fn spawn_cycle(&mut self, job: QueryJob) -> bool {
        let query_id = job.query.id;
        let Some(guard) = self.in_flight.try_acquire(query_id) else {
            tracing::debug!(query_id, "Previous cycle still running, skipping");
            return false;
        };

        let processor = self.processor.clone();
        let permits = self.permits.clone();
        let span = tracing::info_span!("cycle", query_id, service = %job.service.slug);

        self.tasks.spawn(
            async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };

                match processor.run_query(&job).await {
                    Ok(outcome) => {
                        tracing::debug!(outcome = outcome.label(), "Cycle finished");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Cycle aborted on store error");
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_task_exit(result);
        }
    }
}

fn log_task_exit(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            tracing::error!(error = %e, "Cycle task panicked");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Cycle task cancelled");
        }
    }
}
