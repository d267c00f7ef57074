//! Model registry: loads each tier at most once, however many callers ask.
//!
//! Each tier is a small state machine behind one mutex:
//!
//! ```text
//! Unloaded ──ensure_loaded──▶ Loading ──ok──▶ Loaded
//!     ▲                          │
//!     └──── (retry) ── Failed ◀──┘ err / timeout
//! ```
//!
//! The first caller that finds a tier `Unloaded` or `Failed` spawns the load
//! and every caller, including later arrivals, waits on the same watch
//! channel. The load runs in its own task, so a caller that is cancelled
//! never strands the others. `shutdown` resets every tier to `Unloaded`; a
//! load still in flight at that point settles its waiters but installs nothing.

use crate::model::{FaceEngine, ModelError, ModelLoader, Tier};
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

type LoadOutcome = Result<Arc<dyn FaceEngine>, ModelError>;

enum Slot {
    Unloaded,
    /// `load` identifies the task allowed to settle this slot.
    Loading { load: u64, rx: watch::Receiver<Option<LoadOutcome>> },
    Loaded(Arc<dyn FaceEngine>),
    Failed(ModelError),
}

/// Reportable snapshot of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TierState {
    Unloaded,
    Loading,
    /// Carries the loaded model version.
    Loaded(String),
    /// Carries the last load error.
    Failed(String),
}

struct Inner {
    loader: Arc<dyn ModelLoader>,
    slots: Mutex<HashMap<Tier, Slot>>,
    load_timeout: Duration,
    warmup: bool,
    next_load: AtomicU64,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<Tier, Slot>> {
        // Critical sections only swap enum values and cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to the per-tier engines. Cheap to clone.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

impl ModelRegistry {
    /// `warmup` runs one throwaway inference after the precise tier loads.
    pub fn new(loader: Arc<dyn ModelLoader>, load_timeout: Duration, warmup: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                slots: Mutex::new(HashMap::new()),
                load_timeout,
                warmup,
                next_load: AtomicU64::new(0),
            }),
        }
    }

    /// Return the tier's engine, loading it first if needed.
    ///
    /// Concurrent callers share one load and all observe its outcome. A failed
    /// load leaves the tier retriable by the next call.
    pub async fn ensure_loaded(&self, tier: Tier) -> Result<Arc<dyn FaceEngine>, ModelError> {
        let mut rx = {
            let mut slots = self.inner.slots();
            match slots.get(&tier) {
                Some(Slot::Loaded(engine)) => return Ok(Arc::clone(engine)),
                Some(Slot::Loading { rx, .. }) => rx.clone(),
                Some(Slot::Unloaded) | Some(Slot::Failed(_)) | None => {
                    let (tx, rx) = watch::channel(None);
                    let load = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
                    slots.insert(tier, Slot::Loading { load, rx: rx.clone() });
                    self.spawn_load(tier, load, tx);
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ModelError::Abandoned { tier }))
    }

    /// Non-blocking readiness check.
    pub fn is_loaded(&self, tier: Tier) -> bool {
        matches!(self.inner.slots().get(&tier), Some(Slot::Loaded(_)))
    }

    pub fn state(&self, tier: Tier) -> TierState {
        match self.inner.slots().get(&tier) {
            None | Some(Slot::Unloaded) => TierState::Unloaded,
            Some(Slot::Loading { .. }) => TierState::Loading,
            Some(Slot::Loaded(engine)) => TierState::Loaded(engine.model_version().to_string()),
            Some(Slot::Failed(err)) => TierState::Failed(err.to_string()),
        }
    }

    /// Drop every loaded engine and detach loads in flight.
    ///
    /// A detached load still answers the callers already waiting on it, but
    /// its engine is not installed, so every tier ends `Unloaded`.
    pub fn shutdown(&self) {
        let mut slots = self.inner.slots();
        for (tier, slot) in slots.iter_mut() {
            if matches!(slot, Slot::Loaded(_) | Slot::Loading { .. }) {
                tracing::info!(%tier, "unloading tier");
                *slot = Slot::Unloaded;
            }
        }
    }

    fn spawn_load(&self, tier: Tier, load: u64, tx: watch::Sender<Option<LoadOutcome>>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let started = Instant::now();
            let loader = Arc::clone(&inner.loader);
            let job = tokio::task::spawn_blocking(move || loader.load(tier));

            let outcome = match tokio::time::timeout(inner.load_timeout, job).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(ModelError::Backend {
                    tier,
                    reason: format!("loader task failed: {join}"),
                }),
                Err(_) => Err(ModelError::Timeout { tier, after: inner.load_timeout }),
            };

            let installed = {
                let mut slots = inner.slots();
                let current = matches!(slots.get(&tier), Some(Slot::Loading { load: l, .. }) if *l == load);
                match &outcome {
                    _ if !current => {
                        tracing::info!(%tier, "load finished after shutdown; result discarded");
                    }
                    Ok(engine) => {
                        tracing::info!(
                            %tier,
                            version = engine.model_version(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "tier loaded"
                        );
                        slots.insert(tier, Slot::Loaded(Arc::clone(engine)));
                    }
                    Err(err) => {
                        tracing::error!(%tier, error = %err, "tier load failed");
                        slots.insert(tier, Slot::Failed(err.clone()));
                    }
                }
                current
            };

            if let (Ok(engine), Tier::Precise, true, true) = (&outcome, tier, inner.warmup, installed) {
                spawn_warmup(Arc::clone(engine));
            }
            tx.send_replace(Some(outcome));
        });
    }
}

/// One throwaway detection so the first real query does not pay for lazy
/// backend initialization. Failures are logged and otherwise ignored.
fn spawn_warmup(engine: Arc<dyn FaceEngine>) {
    tokio::task::spawn_blocking(move || {
        let blank = RgbImage::new(64, 64);
        match engine.detect(&blank, 0.99) {
            Ok(_) => tracing::debug!(version = engine.model_version(), "warm-up inference done"),
            Err(err) => tracing::warn!(error = %err, "warm-up inference failed"),
        }
    });
}
