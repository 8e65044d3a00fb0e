//! Ownership of the single resident model.
//!
//! The registry is an explicitly constructed, cheaply cloneable handle. Loads
//! run on a blocking worker; callers that ask while a load is in flight wait
//! on the same outcome. Sessions hold [`ModelLease`]s, and an unload requested
//! while leases are outstanding is deferred until the last one drops.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::context::ConversationContext;
use crate::error::LoadError;
use crate::generator::GenerationSession;
use crate::model::{load_model, LoadOptions, LoadedModel};
use crate::sampling::SamplingPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

/// Snapshot published on every lifecycle or progress change.
#[derive(Debug, Clone)]
pub struct LoadStatus {
    pub state: LoadState,
    /// Fraction of the current load in `[0, 1]`.
    pub progress: f32,
    /// Error of the most recent failed load.
    pub error: Option<Arc<LoadError>>,
}

impl LoadStatus {
    fn unloaded() -> Self {
        Self {
            state: LoadState::Unloaded,
            progress: 0.0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Resident and accepting sessions.
    pub ready: bool,
    pub state: LoadState,
    pub progress: f32,
    pub unhealthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded,
    /// Applied once in-flight work lets go of the model.
    Deferred,
}

/// Produces a [`LoadedModel`]; runs on a blocking worker.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, progress: &dyn Fn(f32)) -> Result<LoadedModel, LoadError>;

    fn describe(&self) -> String {
        "model".to_string()
    }
}

/// Loads a model directory and optionally runs a short greedy warm-up.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    dir: PathBuf,
    options: LoadOptions,
    warmup: bool,
}

pub const WARMUP_PROMPT: &str = "Hello!";
pub const WARMUP_TOKENS: usize = 8;

impl DirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            options: LoadOptions::default(),
            warmup: true,
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }
}

impl ModelLoader for DirectoryLoader {
    fn load(&self, progress: &dyn Fn(f32)) -> Result<LoadedModel, LoadError> {
        let model = Arc::new(load_model(&self.dir, &self.options, progress)?);
        if self.warmup {
            let mut context = ConversationContext::new();
            context.user(WARMUP_PROMPT);
            let session = GenerationSession::detached(
                Arc::clone(&model),
                &context,
                SamplingPolicy::greedy(),
                WARMUP_TOKENS,
            )
            .map_err(|e| LoadError::Warmup(Box::new(e)))?;
            let mut produced = 0;
            for event in session {
                event.map_err(|e| LoadError::Warmup(Box::new(e)))?;
                produced += 1;
            }
            debug!(events = produced, "warm-up finished");
        }
        progress(1.0);
        Arc::try_unwrap(model).map_err(|_| LoadError::Worker("warm-up kept the model alive".into()))
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

type LoadOutcome = Result<Arc<LoadedModel>, Arc<LoadError>>;

enum SlotState {
    Unloaded,
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Ready(Arc<LoadedModel>),
}

struct Slot {
    state: SlotState,
    /// Bumped on every load; stale loads compare against it.
    generation: u64,
    leases: usize,
    unload_requested: bool,
    consecutive_failures: u32,
    unhealthy: bool,
}

impl Slot {
    fn clear_health(&mut self) {
        self.unhealthy = false;
        self.consecutive_failures = 0;
    }
}

struct Shared {
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Slot>,
    status: watch::Sender<LoadStatus>,
    /// Woken whenever the lease count drops to zero.
    released: Notify,
    unhealthy_after: u32,
    loads_started: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot still holds consistent state; every update is a
        // single assignment.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: LoadState, progress: f32, error: Option<Arc<LoadError>>) {
        self.status.send_replace(LoadStatus {
            state,
            progress,
            error,
        });
    }

    fn report_progress(&self, generation: u64, progress: f32) {
        let slot = self.lock();
        if slot.generation == generation && matches!(slot.state, SlotState::Loading(_)) {
            self.status.send_modify(|s| s.progress = progress.clamp(0.0, 1.0));
        }
    }

    fn finish_load(
        &self,
        generation: u64,
        result: Result<LoadedModel, LoadError>,
        done: watch::Sender<Option<LoadOutcome>>,
    ) {
        let mut slot = self.lock();
        let outcome: LoadOutcome = if slot.generation != generation
            || !matches!(slot.state, SlotState::Loading(_))
        {
            Err(Arc::new(LoadError::Unloaded))
        } else if slot.unload_requested {
            slot.unload_requested = false;
            slot.state = SlotState::Unloaded;
            match result {
                Ok(_) => {
                    self.publish(LoadState::Unloaded, 0.0, None);
                    warn!("discarding model loaded after an unload request");
                    Err(Arc::new(LoadError::Unloaded))
                }
                // A real failure takes precedence over the unload.
                Err(e) => {
                    let e = Arc::new(e);
                    self.publish(LoadState::Unloaded, 0.0, Some(Arc::clone(&e)));
                    error!(error = %e, "model load failed");
                    Err(e)
                }
            }
        } else {
            match result {
                Ok(model) => {
                    let model = Arc::new(model);
                    slot.state = SlotState::Ready(Arc::clone(&model));
                    self.publish(LoadState::Ready, 1.0, None);
                    info!(source = %self.loader.describe(), "model ready");
                    Ok(model)
                }
                Err(e) => {
                    let e = Arc::new(e);
                    slot.state = SlotState::Unloaded;
                    self.publish(LoadState::Unloaded, 0.0, Some(Arc::clone(&e)));
                    error!(error = %e, "model load failed");
                    Err(e)
                }
            }
        };
        drop(slot);
        // Nobody waiting is fine.
        let _ = done.send(Some(outcome));
    }

    fn release(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.generation != generation {
            return;
        }
        slot.leases = slot.leases.saturating_sub(1);
        if slot.leases > 0 {
            return;
        }
        if slot.unload_requested && matches!(slot.state, SlotState::Ready(_)) {
            slot.unload_requested = false;
            slot.state = SlotState::Unloaded;
            self.publish(LoadState::Unloaded, 0.0, None);
            info!("deferred unload applied");
        }
        drop(slot);
        self.released.notify_waiters();
    }

    fn record_session(&self, generation: u64, ok: bool) {
        let mut slot = self.lock();
        if slot.generation != generation {
            return;
        }
        if ok {
            slot.consecutive_failures = 0;
            return;
        }
        slot.consecutive_failures += 1;
        if slot.consecutive_failures >= self.unhealthy_after && !slot.unhealthy {
            slot.unhealthy = true;
            warn!(
                failures = slot.consecutive_failures,
                "model marked unhealthy, reload required"
            );
        }
    }
}

/// Shared handle to the resident model.
///
/// Dropping the last lease of a model whose unload was deferred completes
/// the unload.
pub struct ModelLease {
    model: Arc<LoadedModel>,
    owner: Option<(Arc<Shared>, u64)>,
}

impl ModelLease {
    /// A lease outside any registry, used for warm-up and tests.
    pub fn detached(model: Arc<LoadedModel>) -> Self {
        Self { model, owner: None }
    }

    pub fn model(&self) -> &Arc<LoadedModel> {
        &self.model
    }

    /// Report whether a session on this lease completed without a compute error.
    pub fn record_session(&self, ok: bool) {
        if let Some((shared, generation)) = &self.owner {
            shared.record_session(*generation, ok);
        }
    }
}

impl Deref for ModelLease {
    type Target = LoadedModel;

    fn deref(&self) -> &LoadedModel {
        &self.model
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if let Some((shared, generation)) = &self.owner {
            shared.release(*generation);
        }
    }
}

impl fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLease")
            .field("generation", &self.owner.as_ref().map(|(_, g)| *g))
            .finish()
    }
}

#[derive(Clone)]
pub struct ModelRegistry {
    shared: Arc<Shared>,
}

pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

impl ModelRegistry {
    pub fn new(loader: impl ModelLoader) -> Self {
        Self::with_threshold(Arc::new(loader), DEFAULT_UNHEALTHY_AFTER)
    }

    /// `unhealthy_after` consecutive failed sessions mark the model unhealthy.
    pub fn with_threshold(loader: Arc<dyn ModelLoader>, unhealthy_after: u32) -> Self {
        let (status, _) = watch::channel(LoadStatus::unloaded());
        Self {
            shared: Arc::new(Shared {
                loader,
                slot: Mutex::new(Slot {
                    state: SlotState::Unloaded,
                    generation: 0,
                    leases: 0,
                    unload_requested: false,
                    consecutive_failures: 0,
                    unhealthy: false,
                }),
                status,
                released: Notify::new(),
                unhealthy_after: unhealthy_after.max(1),
                loads_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Return the resident model, loading it first if needed.
    pub async fn ensure_loaded(&self) -> Result<ModelLease, Arc<LoadError>> {
        let mut done = {
            let mut guard = self.shared.lock();
            let slot = &mut *guard;
            if slot.unhealthy {
                return Err(Arc::new(LoadError::Unhealthy {
                    failures: slot.consecutive_failures,
                }));
            }
            slot.unload_requested = false;
            match &slot.state {
                SlotState::Ready(model) => {
                    let model = Arc::clone(model);
                    slot.leases += 1;
                    return Ok(self.lease(model, slot.generation));
                }
                SlotState::Loading(done) => done.clone(),
                SlotState::Unloaded => self.start_load(slot),
            }
        };

        let outcome = loop {
            let current = done.borrow_and_update().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if done.changed().await.is_err() {
                break Err(Arc::new(LoadError::Worker(
                    "load finished without reporting".to_string(),
                )));
            }
        };
        let model = outcome?;

        let mut guard = self.shared.lock();
        let slot = &mut *guard;
        match &slot.state {
            SlotState::Ready(current) if Arc::ptr_eq(current, &model) => {
                slot.leases += 1;
                Ok(self.lease(model, slot.generation))
            }
            _ => Err(Arc::new(LoadError::Unloaded)),
        }
    }

    fn lease(&self, model: Arc<LoadedModel>, generation: u64) -> ModelLease {
        ModelLease {
            model,
            owner: Some((Arc::clone(&self.shared), generation)),
        }
    }

    fn start_load(&self, slot: &mut Slot) -> watch::Receiver<Option<LoadOutcome>> {
        let (tx, rx) = watch::channel(None);
        slot.generation += 1;
        slot.state = SlotState::Loading(rx.clone());
        let generation = slot.generation;
        self.shared.loads_started.fetch_add(1, Ordering::SeqCst);
        self.shared.publish(LoadState::Loading, 0.0, None);
        info!(source = %self.shared.loader.describe(), generation, "starting model load");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let worker = Arc::clone(&shared);
            let result = tokio::task::spawn_blocking(move || {
                let progress = |p: f32| worker.report_progress(generation, p);
                worker.loader.load(&progress)
            })
            .await
            .unwrap_or_else(|e| Err(LoadError::Worker(e.to_string())));
            shared.finish_load(generation, result, tx);
        });
        rx
    }

    /// Drop the resident model, or defer that until its leases are released.
    pub fn unload(&self) -> UnloadOutcome {
        let mut guard = self.shared.lock();
        let slot = &mut *guard;
        match slot.state {
            SlotState::Unloaded => UnloadOutcome::Unloaded,
            SlotState::Loading(_) => {
                slot.unload_requested = true;
                warn!("unload requested during load, deferring");
                UnloadOutcome::Deferred
            }
            SlotState::Ready(_) if slot.leases == 0 => {
                slot.state = SlotState::Unloaded;
                slot.unload_requested = false;
                self.shared.publish(LoadState::Unloaded, 0.0, None);
                info!("model unloaded");
                UnloadOutcome::Unloaded
            }
            SlotState::Ready(_) => {
                slot.unload_requested = true;
                warn!(leases = slot.leases, "model in use, deferring unload");
                UnloadOutcome::Deferred
            }
        }
    }

    /// Discard the current model (and its health record) and load it again.
    ///
    /// The old model is dropped before the new one loads: with sessions still
    /// running, this waits for their leases to be released. A load already in
    /// flight is joined instead of restarted.
    pub async fn reload(&self) -> Result<ModelLease, Arc<LoadError>> {
        info!("reloading model");
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.shared.released.notified();
            {
                let mut guard = self.shared.lock();
                let slot = &mut *guard;
                match slot.state {
                    SlotState::Loading(_) => {
                        slot.clear_health();
                        break;
                    }
                    // New sessions stay refused while the model is unhealthy.
                    SlotState::Ready(_) if slot.leases > 0 => {
                        slot.unload_requested = true;
                        debug!(leases = slot.leases, "reload waiting for sessions to finish");
                    }
                    _ => {
                        slot.clear_health();
                        slot.unload_requested = false;
                        slot.state = SlotState::Unloaded;
                        self.shared.publish(LoadState::Unloaded, 0.0, None);
                        break;
                    }
                }
            }
            released.await;
        }
        self.ensure_loaded().await
    }

    pub fn status(&self) -> LoadStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadStatus> {
        self.shared.status.subscribe()
    }

    /// Current status followed by every change.
    pub fn progress_stream(&self) -> WatchStream<LoadStatus> {
        WatchStream::new(self.subscribe())
    }

    pub fn health(&self) -> HealthReport {
        let status = self.status();
        let slot = self.shared.lock();
        let state = match slot.state {
            SlotState::Unloaded => LoadState::Unloaded,
            SlotState::Loading(_) => LoadState::Loading,
            SlotState::Ready(_) => LoadState::Ready,
        };
        HealthReport {
            ready: state == LoadState::Ready && !slot.unhealthy,
            state,
            progress: status.progress,
            unhealthy: slot.unhealthy,
            consecutive_failures: slot.consecutive_failures,
            last_error: status.error.map(|e| e.to_string()),
        }
    }

    /// Loads started since construction.
    pub fn load_count(&self) -> usize {
        self.shared.loads_started.load(Ordering::SeqCst)
    }

    pub fn active_leases(&self) -> usize {
        self.shared.lock().leases
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("loader", &self.shared.loader.describe())
            .field("state", &self.status().state)
            .finish()
    }
}
