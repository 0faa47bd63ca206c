//! `timecapsule-digger` — the polling engine.
//!
//! # Overview
//!
//! A [`Digger`] owns a tick timer and drives the capsule lifecycle against a
//! shared [`Store`]: on every tick it digs, hands any due capsule to the
//! registered [`Handler`], then destroys the entry. Any number of diggers —
//! tasks, threads, processes, machines — may poll the same logical store;
//! the store's atomic pop is the only synchronization point, so each entry
//! reaches exactly one digger per pop.
//!
//! Store errors never kill the loop: a failed tick is logged and the next
//! tick proceeds. A failed destroy leaves the entry buried for redelivery —
//! delivery is at-least-once, not exactly-once.
//!
//! Per-tick work runs to completion before the next tick is taken, so a slow
//! handler or store directly throttles that digger's poll rate. There is no
//! queueing of ticks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use timecapsule_core::retry::retry_fixed;
use timecapsule_core::{Capsule, Result, RetryPolicy, Store};

/// Callback invoked synchronously on the digger's tick task, once per dug
/// capsule. The digger itself is passed along so a handler can bury
/// follow-up capsules without holding a separate store reference.
pub trait Handler<P>: Send + Sync {
    fn on_capsule(&self, digger: &Digger<P>, capsule: &Capsule<P>);
}

impl<P, F> Handler<P> for F
where
    F: Fn(&Digger<P>, &Capsule<P>) + Send + Sync,
{
    fn on_capsule(&self, digger: &Digger<P>, capsule: &Capsule<P>) {
        self(digger, capsule)
    }
}

/// Digger tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DiggerOptions {
    /// Attempts for the bounded destroy retry. Default 100.
    pub retry_limit: u32,
    /// Fixed delay between destroy attempts. Default 500 ms.
    pub retry_interval: Duration,
    /// Upper bound on a single dig or destroy call. Default 1 minute.
    pub op_timeout: Duration,
}

impl Default for DiggerOptions {
    fn default() -> Self {
        Self {
            retry_limit: 100,
            retry_interval: Duration::from_millis(500),
            op_timeout: Duration::from_secs(60),
        }
    }
}

impl DiggerOptions {
    /// Only positive values override: zero fields fall back to the defaults.
    fn or_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            retry_limit: if self.retry_limit == 0 {
                defaults.retry_limit
            } else {
                self.retry_limit
            },
            retry_interval: if self.retry_interval.is_zero() {
                defaults.retry_interval
            } else {
                self.retry_interval
            },
            op_timeout: if self.op_timeout.is_zero() {
                defaults.op_timeout
            } else {
                self.op_timeout
            },
        }
    }
}

/// The polling engine. Cheaply cloneable handle — clones control the same
/// underlying loop.
pub struct Digger<P> {
    inner: Arc<Inner<P>>,
}

struct Inner<P> {
    store: Arc<dyn Store<P>>,
    dig_interval: Duration,
    options: DiggerOptions,
    handler: OnceCell<Box<dyn Handler<P>>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P> Clone for Digger<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for Digger<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digger")
            .field("backend", &self.inner.store.kind())
            .field("dig_interval", &self.inner.dig_interval)
            .finish_non_exhaustive()
    }
}

impl<P> Digger<P>
where
    P: Send + Sync + 'static,
{
    /// A digger polling `store` every `dig_interval`, with default options.
    pub fn new(store: Arc<dyn Store<P>>, dig_interval: Duration) -> Self {
        Self::with_options(store, dig_interval, DiggerOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn Store<P>>,
        dig_interval: Duration,
        options: DiggerOptions,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                dig_interval,
                options: options.or_defaults(),
                handler: OnceCell::new(),
                stop,
                task: Mutex::new(None),
            }),
        }
    }

    /// Register the capsule handler. Set exactly once: the first handler
    /// wins and later calls are ignored with a warning.
    pub fn set_handler<H>(&self, handler: H)
    where
        H: Handler<P> + 'static,
    {
        if self.inner.handler.set(Box::new(handler)).is_err() {
            warn!("digger handler already set; ignoring replacement");
        }
    }

    /// Start the polling loop on a background task.
    ///
    /// The loop blocks on the tick timer or the stop signal — nothing spins
    /// between ticks. Calling `start` while the loop is running is a no-op.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().expect("digger task slot poisoned");
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("digger already running");
            return;
        }

        self.inner.stop.send_replace(false);
        let mut stop = self.inner.stop.subscribe();
        let digger = self.clone();

        *task = Some(tokio::spawn(async move {
            debug!(backend = digger.inner.store.kind(), "digger started");
            let mut ticker = tokio::time::interval(digger.inner.dig_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; consume it so
            // the first dig lands one full interval after start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => digger.poll_once().await,
                    changed = stop.changed() => {
                        // Err: every sender handle is gone; treat as stop.
                        if changed.is_err() || *stop.borrow() {
                            debug!(backend = digger.inner.store.kind(), "digger stopped");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signal the loop to stop. Idempotent, and never blocks on in-flight
    /// work: the loop observes the signal at its next suspension point, and
    /// no further ticks start new work.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Whether the polling loop is currently running.
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .expect("digger task slot poisoned")
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Pass-through to [`Store::bury_for`] on the underlying store.
    pub async fn bury_for(&self, payload: P, delay: Duration) -> Result<()> {
        self.inner.store.bury_for(payload, delay).await
    }

    /// Pass-through to [`Store::bury_until`] on the underlying store.
    pub async fn bury_until(&self, payload: P, due_at_ms: i64) -> Result<()> {
        self.inner.store.bury_until(payload, due_at_ms).await
    }

    /// The shared store this digger polls.
    pub fn store(&self) -> Arc<dyn Store<P>> {
        Arc::clone(&self.inner.store)
    }

    /// One poll tick: dig, dispatch, destroy.
    async fn poll_once(&self) {
        let store = &self.inner.store;
        let options = &self.inner.options;

        let dug = match timeout(options.op_timeout, store.dig()).await {
            Ok(Ok(dug)) => dug,
            Ok(Err(e)) => {
                // Non-fatal: the entry (if any) is either still queued or
                // was a poison pill; the loop carries on next tick.
                error!(backend = store.kind(), "dig failed: {e}");
                return;
            }
            Err(_) => {
                error!(backend = store.kind(), "dig timed out");
                return;
            }
        };

        let Some(capsule) = dug else { return };
        debug!(backend = store.kind(), "dug up a capsule");

        if let Some(handler) = self.inner.handler.get() {
            handler.on_capsule(self, &capsule);
        }

        self.destroy(&capsule).await;
    }

    /// Destroy a delivered capsule, retrying on transient failure. Failures
    /// are logged, never propagated: the entry stays buried and will be dug
    /// up (and delivered) again — at-least-once delivery.
    async fn destroy(&self, capsule: &Capsule<P>) {
        let store = &self.inner.store;
        let options = &self.inner.options;
        let policy = RetryPolicy::new(options.retry_limit, options.retry_interval);

        let destroyed = timeout(
            options.op_timeout,
            retry_fixed(policy, || store.destroy(capsule)),
        )
        .await;

        match destroyed {
            Ok(Ok(())) => debug!(backend = store.kind(), "destroyed a delivered capsule"),
            Ok(Err(e)) => error!(
                backend = store.kind(),
                attempts = policy.attempts,
                "destroy exhausted, capsule stays buried for redelivery: {e}"
            ),
            Err(_) => error!(
                backend = store.kind(),
                "destroy timed out, capsule stays buried for redelivery"
            ),
        }
    }
}
