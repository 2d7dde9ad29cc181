//! Per-pool background task orchestration.
//!
//! One call to [`run`] drives one pool with four long-running tasks:
//!
//! - the builder dispatcher, sole consumer of the create queue, spawning
//!   one task per dequeued index;
//! - the reconciler, enqueueing missing indices every tick;
//! - the event listener, enqueueing indices from deleted-instance events,
//!   reconnecting with exponential backoff;
//! - the reaper, force-stopping stale agents every tick.
//!
//! Shutdown is a `watch` channel fanned out to every task. The reconciler
//! and listener drop their queue senders on exit, which closes the queue
//! and lets the dispatcher drain and stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, ListenerConfig};
use crate::pool::Pool;

/// Run one pool's control loops until `shutdown` fires and the queue
/// drains.
pub async fn run(pool: Arc<Pool>, conf: DaemonConfig, shutdown: watch::Receiver<bool>) {
    // Rendezvous-style queue: producers block while the dispatcher is busy
    // handing off the previous index.
    let (tx, rx) = mpsc::channel::<usize>(1);

    let builder = tokio::spawn(dispatch_creates(pool.clone(), rx, shutdown.clone()));
    let reconciler = tokio::spawn(run_reconciler(
        pool.clone(),
        conf.reconcile_interval,
        tx.clone(),
        shutdown.clone(),
    ));
    let listener = tokio::spawn(run_listener(
        pool.clone(),
        conf.listener,
        tx,
        shutdown.clone(),
    ));
    let reaper = tokio::spawn(run_reaper(pool, conf.reaper_interval, shutdown));

    let _ = tokio::join!(builder, reconciler, listener, reaper);
}

/// Consume the create queue, spawning one create task per index.
///
/// Per-index concurrency is bounded to one by the pool's in-flight set;
/// across indices creates run in parallel.
async fn dispatch_creates(
    pool: Arc<Pool>,
    mut rx: mpsc::Receiver<usize>,
    shutdown: watch::Receiver<bool>,
) {
    info!(pool = %pool.name(), task = "agent-builder", "starting task");

    while let Some(idx) = rx.recv().await {
        let pool = pool.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!(pool = %pool.name(), idx, "creating agent");
            tokio::select! {
                result = pool.create_agent(idx) => {
                    if let Err(e) = result {
                        error!(pool = %pool.name(), idx, err = %e, "failed to create agent");
                    }
                }
                _ = shutdown_signal(&mut shutdown) => {}
            }
        });
    }

    info!(pool = %pool.name(), task = "agent-builder", "exiting task");
}

async fn run_reconciler(
    pool: Arc<Pool>,
    interval: Duration,
    tx: mpsc::Sender<usize>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(pool = %pool.name(), task = "reconciler", "starting task");

    // The first tick completes immediately: one reconcile pass at startup,
    // then one per interval.
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pool.reconcile(&tx).await {
                    error!(pool = %pool.name(), err = %e, "reconcile failed");
                }
            }
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }

    info!(pool = %pool.name(), task = "reconciler", "exiting task");
}

async fn run_listener(
    pool: Arc<Pool>,
    conf: ListenerConfig,
    tx: mpsc::Sender<usize>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(pool = %pool.name(), task = "event-listener", "starting task");

    let mut attempt: u32 = 0;
    loop {
        match pool.listen_for_deletes(&tx, shutdown.clone()).await {
            Ok(()) => break,
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                let delay = retry_delay(&conf, attempt);
                warn!(
                    pool = %pool.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    err = %e,
                    "event listener disconnected, retrying"
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signal(&mut shutdown) => break,
                }
            }
        }
    }

    info!(pool = %pool.name(), task = "event-listener", "exiting task");
}

async fn run_reaper(pool: Arc<Pool>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(pool = %pool.name(), task = "reaper", "starting task");

    let mut ticker = tokio::time::interval(interval);
    // Unlike the reconciler, the reaper has no startup pass.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pool.reap().await {
                    error!(pool = %pool.name(), err = %e, "reaper error");
                }
            }
            _ = shutdown_signal(&mut shutdown) => break,
        }
    }

    info!(pool = %pool.name(), task = "reaper", "exiting task");
}

/// Await until `shutdown` fires.
///
/// Wrapping the `wait_for` await here (rather than inlining it in a
/// `select!` branch) keeps the branch's output type `Send`: the `watch::Ref`
/// that `wait_for` resolves to is not `Send`, and `select!`'s generated
/// output enum must be `Send` across all branches for the surrounding
/// future to be spawnable.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Exponential backoff: base doubled per attempt, capped.
fn retry_delay(conf: &ListenerConfig, attempt: u32) -> Duration {
    conf.retry_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(conf.max_retry_delay)
}
