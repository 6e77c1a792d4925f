//! Model lifecycle controller.
//!
//! One state machine per model (`Stopped -> Starting -> Routing`, with
//! `Failed` on probe or process failure), a process-wide start serial so at
//! most one model is ever in `Starting`, priority-ordered launch-variant
//! selection, admission against free device memory with eviction of idle
//! models, and a periodic idle sweeper.
//!
//! Locking discipline: per-model runtime locks are short-held and never
//! held across health probes, process control, or database writes. The
//! start serial is the only long-held lock and is never acquired while a
//! runtime lock is held.

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Catalogue, LaunchVariant, ModelConfig, ProgramConfig};
use crate::devices::DeviceRegistry;
use crate::errors::GatewayError;
use crate::interfaces::InterfaceRegistry;
use crate::logs::LogFanout;
use crate::process::{ProcessHandle, ProcessRunner};
use crate::store::AccountingStore;
use crate::unix_ts;

/// Sweeper period for idle collection and process liveness.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat period for advancing open runtime intervals.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle states of a managed model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelState {
    Stopped,
    Starting,
    Routing,
    Failed { reason: String },
}

impl ModelState {
    pub fn label(&self) -> &'static str {
        match self {
            ModelState::Stopped => "stopped",
            ModelState::Starting => "starting",
            ModelState::Routing => "routing",
            ModelState::Failed { .. } => "failed",
        }
    }
}

struct ModelRuntime {
    state: ModelState,
    /// Name of the selected launch variant while non-Stopped
    variant: Option<String>,
    handle: Option<Arc<ProcessHandle>>,
    /// Fires when a stop aborts an in-progress start
    cancel: Option<CancellationToken>,
    /// True from the moment a start is queued until its waiters drain
    start_requested: bool,
}

struct ModelEntry {
    name: String,
    config: Arc<ModelConfig>,
    runtime: Mutex<ModelRuntime>,
    in_flight: AtomicUsize,
    /// Epoch millis of the last request start or end; 0 = never
    last_activity_ms: AtomicU64,
    pending: Mutex<Vec<oneshot::Sender<Result<(), GatewayError>>>>,
}

impl ModelEntry {
    fn touch_activity(&self) {
        self.last_activity_ms
            .store((unix_ts() * 1000.0) as u64, Ordering::SeqCst);
    }

    fn idle_seconds(&self) -> Option<f64> {
        let ms = self.last_activity_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| unix_ts() - (ms as f64 / 1000.0))
    }
}

/// Status view of one model, for the management API.
#[derive(Debug, Serialize)]
pub struct ModelStatusView {
    pub aliases: Vec<String>,
    pub mode: String,
    pub port: u16,
    pub status: String,
    pub pid: Option<u32>,
    pub variant: Option<String>,
    pub in_flight: usize,
    pub idle_time_sec: Option<f64>,
    pub is_available: bool,
    pub auto_start: bool,
    pub failure_reason: Option<String>,
}

struct Inner {
    catalogue: Arc<Catalogue>,
    devices: Arc<DeviceRegistry>,
    interfaces: Arc<InterfaceRegistry>,
    runner: ProcessRunner,
    store: Arc<AccountingStore>,
    fanout: Arc<LogFanout>,
    entries: HashMap<String, Arc<ModelEntry>>,
    /// Process-wide start serial: at most one model in Starting at a time
    start_serial: Mutex<()>,
    health_timeout: Duration,
    stop_grace: Duration,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

/// The lifecycle controller. Cheap to clone; all clones share state.
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl Clone for LifecycleController {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// First variant, in declared order, whose required devices are all online.
pub fn select_variant<'a>(
    model: &'a ModelConfig,
    online: &BTreeSet<String>,
) -> Option<&'a LaunchVariant> {
    model
        .variants
        .iter()
        .find(|v| v.required_devices.iter().all(|d| online.contains(d)))
}

/// Pick eviction victims, oldest idle first, until every device deficit is
/// covered by their reservations. Returns `None` when even stopping every
/// candidate would not free enough.
fn plan_reclaim(
    deficit: &BTreeMap<String, u64>,
    candidates: &[(String, BTreeMap<String, u64>)],
) -> Option<Vec<String>> {
    let mut remaining: BTreeMap<&str, u64> = deficit
        .iter()
        .filter(|(_, v)| **v > 0)
        .map(|(k, v)| (k.as_str(), *v))
        .collect();
    if remaining.is_empty() {
        return Some(Vec::new());
    }

    let mut victims = Vec::new();
    for (name, reserved) in candidates {
        if remaining.is_empty() {
            break;
        }
        let helps = reserved.keys().any(|d| remaining.contains_key(d.as_str()));
        if !helps {
            continue;
        }
        victims.push(name.clone());
        for (device, mb) in reserved {
            if let Some(need) = remaining.get_mut(device.as_str()) {
                *need = need.saturating_sub(*mb);
                if *need == 0 {
                    remaining.remove(device.as_str());
                }
            }
        }
    }

    remaining.is_empty().then_some(victims)
}

impl LifecycleController {
    pub fn new(
        catalogue: Arc<Catalogue>,
        devices: Arc<DeviceRegistry>,
        interfaces: Arc<InterfaceRegistry>,
        store: Arc<AccountingStore>,
        fanout: Arc<LogFanout>,
        program: &ProgramConfig,
    ) -> Self {
        let entries = catalogue
            .names()
            .map(|name| {
                let config = Arc::clone(catalogue.get(name).unwrap());
                fanout.register(name);
                (
                    name.to_string(),
                    Arc::new(ModelEntry {
                        name: name.to_string(),
                        config,
                        runtime: Mutex::new(ModelRuntime {
                            state: ModelState::Stopped,
                            variant: None,
                            handle: None,
                            cancel: None,
                            start_requested: false,
                        }),
                        in_flight: AtomicUsize::new(0),
                        last_activity_ms: AtomicU64::new(0),
                        pending: Mutex::new(Vec::new()),
                    }),
                )
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                catalogue,
                devices,
                interfaces,
                runner: ProcessRunner::new(Arc::clone(&fanout)),
                store,
                fanout,
                entries,
                start_serial: Mutex::new(()),
                health_timeout: program.health_timeout(),
                stop_grace: program.stop_grace(),
                idle_timeout: program.idle_timeout(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn entry(&self, canonical: &str) -> Result<&Arc<ModelEntry>, GatewayError> {
        self.inner
            .entries
            .get(canonical)
            .ok_or_else(|| GatewayError::ModelNotFound(canonical.to_string()))
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.inner.catalogue
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.inner.devices
    }

    pub fn interfaces(&self) -> &Arc<InterfaceRegistry> {
        &self.inner.interfaces
    }

    pub fn fanout(&self) -> &Arc<LogFanout> {
        &self.inner.fanout
    }

    pub fn store(&self) -> &Arc<AccountingStore> {
        &self.inner.store
    }

    // -- queries ---------------------------------------------------------

    pub fn in_flight_count(&self, canonical: &str) -> usize {
        self.inner
            .entries
            .get(canonical)
            .map(|e| e.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub async fn state(&self, canonical: &str) -> Option<ModelState> {
        let entry = self.inner.entries.get(canonical)?;
        Some(entry.runtime.lock().await.state.clone())
    }

    pub async fn is_routing(&self, canonical: &str) -> bool {
        matches!(self.state(canonical).await, Some(ModelState::Routing))
    }

    pub async fn running_count(&self) -> usize {
        let mut count = 0;
        for entry in self.inner.entries.values() {
            if matches!(entry.runtime.lock().await.state, ModelState::Routing) {
                count += 1;
            }
        }
        count
    }

    pub fn models_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub async fn status(&self, canonical: &str) -> Option<ModelStatusView> {
        let entry = self.inner.entries.get(canonical)?;
        let online = self.inner.devices.online_set().await;
        let rt = entry.runtime.lock().await;

        Some(ModelStatusView {
            aliases: entry.config.aliases.clone(),
            mode: entry.config.mode.clone(),
            port: entry.config.port,
            status: rt.state.label().to_string(),
            pid: rt.handle.as_ref().map(|h| h.pid()),
            variant: rt.variant.clone(),
            in_flight: entry.in_flight.load(Ordering::SeqCst),
            idle_time_sec: entry.idle_seconds(),
            is_available: select_variant(&entry.config, &online).is_some(),
            auto_start: entry.config.auto_start,
            failure_reason: match &rt.state {
                ModelState::Failed { reason } => Some(reason.clone()),
                _ => None,
            },
        })
    }

    pub async fn all_status(&self) -> BTreeMap<String, ModelStatusView> {
        let mut out = BTreeMap::new();
        for name in self.inner.entries.keys() {
            if let Some(view) = self.status(name).await {
                out.insert(name.clone(), view);
            }
        }
        out
    }

    // -- in-flight tracking ------------------------------------------------

    /// Acquire an in-flight guard for a forwarded request. Refreshes the
    /// idle clock on both acquisition and release.
    pub fn acquire_in_flight(&self, canonical: &str) -> Option<InFlightGuard> {
        let entry = self.inner.entries.get(canonical)?;
        let count = entry.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        entry.touch_activity();
        gauge!("llmfleet_in_flight", "model" => canonical.to_string()).set(count as f64);
        Some(InFlightGuard {
            entry: Arc::clone(entry),
        })
    }

    // -- ensure_running ----------------------------------------------------

    /// Block until the model is `Routing` or the start fails. Concurrent
    /// calls for the same model coalesce on one attempt. `with_deadline`
    /// bounds the health probe with the configured window; the admin path
    /// passes `false` and relies on cancellation alone.
    pub async fn ensure_running(
        &self,
        canonical: &str,
        with_deadline: bool,
    ) -> Result<(), GatewayError> {
        let entry = Arc::clone(self.entry(canonical)?);

        let rx = {
            let mut rt = entry.runtime.lock().await;
            match rt.state {
                ModelState::Routing => return Ok(()),
                _ => {
                    let (tx, rx) = oneshot::channel();
                    entry.pending.lock().await.push(tx);
                    if !rt.start_requested {
                        rt.start_requested = true;
                        self.spawn_start(Arc::clone(&entry), with_deadline);
                    }
                    rx
                }
            }
        };

        // A dropped waiter (client disconnect) releases the caller but the
        // start attempt itself keeps going for the next request.
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Internal(
                "start attempt dropped its waiters".to_string(),
            )),
        }
    }

    fn spawn_start(&self, entry: Arc<ModelEntry>, with_deadline: bool) {
        let ctrl = self.clone();
        tokio::spawn(async move {
            ctrl.run_start(entry, with_deadline).await;
        });
    }

    async fn run_start(&self, entry: Arc<ModelEntry>, with_deadline: bool) {
        // Total order of starts: one model in Starting at any instant.
        let _serial = self.inner.start_serial.lock().await;
        let started_at = Instant::now();

        let cancel = CancellationToken::new();
        {
            let mut rt = entry.runtime.lock().await;
            match rt.state {
                ModelState::Routing => {
                    rt.start_requested = false;
                    let mut pending = entry.pending.lock().await;
                    for tx in pending.drain(..) {
                        let _ = tx.send(Ok(()));
                    }
                    return;
                }
                ModelState::Starting => {
                    // Another attempt owns this start; should not happen
                    // with start_requested, but never double-own.
                    return;
                }
                _ => {
                    rt.state = ModelState::Starting;
                    rt.variant = None;
                    rt.cancel = Some(cancel.clone());
                }
            }
        }

        info!(model = %entry.name, "Starting model");
        self.inner
            .fanout
            .append(&entry.name, format!("--- starting model '{}'", entry.name));
        counter!("llmfleet_starts_total", "model" => entry.name.clone()).increment(1);

        let mut outcome = self.start_attempt(&entry, &cancel, with_deadline).await;

        match &outcome {
            Ok(()) => {
                entry.touch_activity();
                let ts = unix_ts();
                if let Err(e) = self.inner.store.runtime_open(&entry.name, ts).await {
                    warn!(model = %entry.name, error = %e, "failed to open runtime interval");
                }
                histogram!("llmfleet_start_duration_seconds", "model" => entry.name.clone())
                    .record(started_at.elapsed().as_secs_f64());
            }
            Err(e) => {
                // Reap anything the failed attempt left behind.
                let handle = {
                    let mut rt = entry.runtime.lock().await;
                    rt.handle.take()
                };
                if let Some(handle) = handle {
                    self.inner.runner.stop(&handle, self.inner.stop_grace).await;
                }
                counter!("llmfleet_start_failures_total", "model" => entry.name.clone())
                    .increment(1);
                self.inner
                    .fanout
                    .append(&entry.name, format!("--- start failed: {e}"));
                error!(model = %entry.name, error = %e, "Model start failed");
            }
        }

        // Finalise the state and drain waiters under the runtime lock, so
        // an ensure_running call landing now either sees the final state or
        // its waiter is in this drain. Lock order is runtime, then pending.
        {
            let mut rt = entry.runtime.lock().await;
            rt.cancel = None;
            rt.start_requested = false;
            match &outcome {
                Ok(()) => {
                    if matches!(rt.state, ModelState::Starting) {
                        rt.state = ModelState::Routing;
                    } else {
                        // A stop raced the last stretch of the attempt.
                        outcome = Err(GatewayError::BackendUnavailable {
                            model: entry.name.clone(),
                            reason: "stopped during start".to_string(),
                        });
                    }
                }
                Err(e) => {
                    // A stop during Starting already moved us to Stopped
                    // and reaped the child; keep that.
                    if matches!(rt.state, ModelState::Starting) {
                        rt.state = ModelState::Failed {
                            reason: e.to_string(),
                        };
                    } else if matches!(rt.state, ModelState::Stopped) {
                        rt.variant = None;
                    }
                }
            }

            let mut pending = entry.pending.lock().await;
            let count = pending.len();
            for tx in pending.drain(..) {
                let _ = tx.send(outcome.clone());
            }
            debug!(model = %entry.name, count, "notified start waiters");
        }

        if outcome.is_ok() {
            self.inner
                .fanout
                .append(&entry.name, format!("--- model '{}' is routing", entry.name));
            info!(
                model = %entry.name,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Model is routing"
            );
        }
    }

    async fn start_attempt(
        &self,
        entry: &Arc<ModelEntry>,
        cancel: &CancellationToken,
        with_deadline: bool,
    ) -> Result<(), GatewayError> {
        let online = self.inner.devices.online_set().await;
        let variant = select_variant(&entry.config, &online)
            .ok_or_else(|| GatewayError::NoUsableDevice(entry.name.clone()))?
            .clone();

        {
            let mut rt = entry.runtime.lock().await;
            rt.variant = Some(variant.name.clone());
        }
        self.inner.fanout.append(
            &entry.name,
            format!("--- using launch variant '{}'", variant.name),
        );

        self.admit(entry, &variant).await?;

        let handle = self
            .inner
            .runner
            .spawn(&entry.name, &variant.script)
            .map_err(|e| GatewayError::BackendUnavailable {
                model: entry.name.clone(),
                reason: format!("spawn failed: {e}"),
            })?;
        let handle = Arc::new(handle);
        {
            let mut rt = entry.runtime.lock().await;
            rt.handle = Some(Arc::clone(&handle));
        }

        let adapter = self
            .inner
            .interfaces
            .get(&entry.config.mode)
            .ok_or_else(|| {
                GatewayError::Internal(format!("no interface adapter for {}", entry.config.mode))
            })?;

        let deadline = with_deadline.then(|| Instant::now() + self.inner.health_timeout);
        let runner = &self.inner.runner;
        let exit_watch = async {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !runner.alive(&handle).await {
                    return;
                }
            }
        };

        let health = tokio::select! {
            result = adapter.health(&entry.name, entry.config.port, deadline, cancel) => result,
            _ = exit_watch => Err("process exited during startup".to_string()),
        };

        match health {
            Ok(()) => Ok(()),
            Err(reason) => {
                if cancel.is_cancelled() {
                    Err(GatewayError::BackendUnavailable {
                        model: entry.name.clone(),
                        reason: "start cancelled".to_string(),
                    })
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    Err(GatewayError::StartTimeout {
                        model: entry.name.clone(),
                        timeout_secs: self.inner.health_timeout.as_secs(),
                    })
                } else {
                    Err(GatewayError::BackendUnavailable {
                        model: entry.name.clone(),
                        reason,
                    })
                }
            }
        }
    }

    // -- admission -----------------------------------------------------------

    /// Reservations held by models currently in `Starting` on one device,
    /// excluding `exclude`. Snapshots can run behind reality by the cache
    /// TTL, so admission subtracts these to avoid double-counting.
    async fn reserved_for_starting(&self, device: &str, exclude: &str) -> u64 {
        let mut reserved = 0;
        for entry in self.inner.entries.values() {
            if entry.name == exclude {
                continue;
            }
            let rt = entry.runtime.lock().await;
            if matches!(rt.state, ModelState::Starting) {
                if let Some(variant_name) = &rt.variant {
                    if let Some(variant) = entry
                        .config
                        .variants
                        .iter()
                        .find(|v| &v.name == variant_name)
                    {
                        reserved += variant.memory_mb.get(device).copied().unwrap_or(0);
                    }
                }
            }
        }
        reserved
    }

    /// Per-device shortfall for a candidate variant; empty when it fits.
    async fn admission_deficit(
        &self,
        entry: &ModelEntry,
        variant: &LaunchVariant,
    ) -> Result<BTreeMap<String, u64>, GatewayError> {
        let mut deficit = BTreeMap::new();
        for (device, need) in &variant.memory_mb {
            let Some(snapshot) = self.inner.devices.snapshot(device).await else {
                // A required device going offline mid-start reads as an
                // unmeetable deficit on that device.
                deficit.insert(device.clone(), *need);
                continue;
            };
            let reserved = self.reserved_for_starting(device, &entry.name).await;
            let free = snapshot.free_mb.saturating_sub(reserved);
            if free < *need {
                deficit.insert(device.clone(), *need - free);
            }
        }
        Ok(deficit)
    }

    async fn admit(
        &self,
        entry: &Arc<ModelEntry>,
        variant: &LaunchVariant,
    ) -> Result<(), GatewayError> {
        let deficit = self.admission_deficit(entry, variant).await?;
        if deficit.is_empty() {
            return Ok(());
        }
        warn!(model = %entry.name, deficit = ?deficit, "admission shortfall, looking for idle models");

        // Eviction candidates: routing, idle, oldest activity first. A
        // model with in-flight requests is never preempted.
        let mut candidates: Vec<(u64, String, BTreeMap<String, u64>)> = Vec::new();
        for other in self.inner.entries.values() {
            if other.name == entry.name || other.in_flight.load(Ordering::SeqCst) > 0 {
                continue;
            }
            let rt = other.runtime.lock().await;
            if !matches!(rt.state, ModelState::Routing) {
                continue;
            }
            let Some(variant_name) = rt.variant.clone() else {
                continue;
            };
            let Some(reserved) = other
                .config
                .variants
                .iter()
                .find(|v| v.name == variant_name)
                .map(|v| v.memory_mb.clone())
            else {
                continue;
            };
            candidates.push((
                other.last_activity_ms.load(Ordering::SeqCst),
                other.name.clone(),
                reserved,
            ));
        }
        candidates.sort_by_key(|(activity, _, _)| *activity);

        let plan_input: Vec<(String, BTreeMap<String, u64>)> = candidates
            .into_iter()
            .map(|(_, name, reserved)| (name, reserved))
            .collect();

        let Some(victims) = plan_reclaim(&deficit, &plan_input) else {
            return Err(GatewayError::InsufficientMemory(entry.name.clone()));
        };

        for victim in &victims {
            info!(model = %entry.name, victim = %victim, "evicting idle model to reclaim memory");
            self.inner
                .fanout
                .append(&entry.name, format!("--- evicting idle model '{victim}'"));
            counter!("llmfleet_evictions_total", "victim" => victim.clone()).increment(1);
            if let Err(e) = self.stop(victim).await {
                warn!(victim = %victim, error = %e, "eviction stop failed");
            }
        }

        // Re-check against real reclamation; freed memory can take a
        // moment to show up in snapshots.
        for _ in 0..6 {
            self.inner.devices.refresh().await;
            if self.admission_deficit(entry, variant).await?.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Err(GatewayError::InsufficientMemory(entry.name.clone()))
    }

    // -- stop ------------------------------------------------------------

    /// Stop a model. Idempotent; a stop during `Starting` aborts the probe
    /// and kills the child without waiting for the health window.
    pub async fn stop(&self, canonical: &str) -> Result<(), GatewayError> {
        let entry = Arc::clone(self.entry(canonical)?);

        let (handle, was_routing) = {
            let mut rt = entry.runtime.lock().await;
            match rt.state {
                ModelState::Stopped | ModelState::Failed { .. } => return Ok(()),
                ModelState::Starting => {
                    if let Some(cancel) = rt.cancel.take() {
                        cancel.cancel();
                    }
                    rt.state = ModelState::Stopped;
                    rt.variant = None;
                    (rt.handle.take(), false)
                }
                ModelState::Routing => {
                    rt.state = ModelState::Stopped;
                    rt.variant = None;
                    (rt.handle.take(), true)
                }
            }
        };

        if let Some(handle) = handle {
            self.inner.runner.stop(&handle, self.inner.stop_grace).await;
        }

        if was_routing {
            let ts = unix_ts();
            if let Err(e) = self.inner.store.runtime_touch(canonical, ts).await {
                warn!(model = %canonical, error = %e, "failed to close runtime interval");
            }
        }

        entry.last_activity_ms.store(0, Ordering::SeqCst);
        self.inner
            .fanout
            .append(canonical, format!("--- model '{canonical}' stopped"));
        info!(model = %canonical, "Model stopped");
        Ok(())
    }

    /// Stop every model that is `Routing` or `Starting`.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for name in self.inner.entries.keys() {
            let active = {
                let rt = self.inner.entries[name].runtime.lock().await;
                matches!(rt.state, ModelState::Routing | ModelState::Starting)
            };
            if active && self.stop(name).await.is_ok() {
                stopped.push(name.clone());
            }
        }
        stopped
    }

    /// Start every model flagged `auto_start`, sequentially (starts are
    /// serialised anyway).
    pub async fn start_auto_start_models(&self) -> Vec<String> {
        let mut started = Vec::new();
        for name in self.inner.catalogue.names() {
            let Some(config) = self.inner.catalogue.get(name) else {
                continue;
            };
            if !config.auto_start {
                continue;
            }
            match self.ensure_running(name, true).await {
                Ok(()) => started.push(name.to_string()),
                Err(e) => warn!(model = %name, error = %e, "auto-start failed"),
            }
        }
        started
    }

    // -- background tasks --------------------------------------------------

    /// Spawn the idle sweeper and the runtime heartbeat. Both end when
    /// [`LifecycleController::shutdown`] is called.
    pub fn spawn_background_tasks(&self) {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => sweeper.sweep_once().await,
                    _ = sweeper.inner.shutdown.cancelled() => return,
                }
            }
        });

        let heartbeat = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => heartbeat.heartbeat_once().await,
                    _ = heartbeat.inner.shutdown.cancelled() => return,
                }
            }
        });
    }

    /// One idle-GC pass: stop routing models whose idle time exceeds the
    /// timeout and that have no in-flight requests.
    pub async fn sweep_once(&self) {
        let Some(idle_timeout) = self.inner.idle_timeout else {
            return;
        };

        for entry in self.inner.entries.values() {
            // Consistent snapshot: state under the lock, counters atomic.
            let routing = {
                let rt = entry.runtime.lock().await;
                matches!(rt.state, ModelState::Routing)
            };
            if !routing || entry.in_flight.load(Ordering::SeqCst) > 0 {
                continue;
            }
            let Some(idle) = entry.idle_seconds() else {
                continue;
            };
            if idle > idle_timeout.as_secs_f64() {
                info!(model = %entry.name, idle_sec = idle as u64, "idle timeout, stopping model");
                counter!("llmfleet_idle_stops_total", "model" => entry.name.clone()).increment(1);
                if let Err(e) = self.stop(&entry.name).await {
                    warn!(model = %entry.name, error = %e, "idle stop failed");
                }
            }
        }
    }

    /// One heartbeat pass: advance open runtime intervals and detect
    /// backends that died underneath us.
    pub async fn heartbeat_once(&self) {
        let ts = unix_ts();
        if let Err(e) = self.inner.store.program_runtime_touch(ts).await {
            warn!(error = %e, "failed to advance program runtime");
        }

        for entry in self.inner.entries.values() {
            let handle = {
                let rt = entry.runtime.lock().await;
                if !matches!(rt.state, ModelState::Routing) {
                    continue;
                }
                rt.handle.clone()
            };

            let alive = match &handle {
                Some(handle) => self.inner.runner.alive(handle).await,
                None => false,
            };

            if alive {
                if let Err(e) = self.inner.store.runtime_touch(&entry.name, ts).await {
                    warn!(model = %entry.name, error = %e, "failed to advance runtime interval");
                }
            } else {
                warn!(model = %entry.name, "backend process exited unexpectedly");
                let mut rt = entry.runtime.lock().await;
                if matches!(rt.state, ModelState::Routing) {
                    rt.state = ModelState::Failed {
                        reason: "process exited".to_string(),
                    };
                    rt.handle = None;
                    rt.variant = None;
                }
                drop(rt);
                if let Err(e) = self.inner.store.runtime_touch(&entry.name, ts).await {
                    warn!(model = %entry.name, error = %e, "failed to close runtime interval");
                }
                self.inner
                    .fanout
                    .append(&entry.name, "--- backend process exited");
            }
        }
    }

    /// Stop everything and finalise runtime intervals.
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle controller");
        self.inner.shutdown.cancel();
        let stopped = self.stop_all().await;
        if let Err(e) = self.inner.store.program_runtime_touch(unix_ts()).await {
            warn!(error = %e, "failed to finalise program runtime");
        }
        info!(stopped = stopped.len(), "Lifecycle controller shut down");
    }
}

/// Guard that tracks one forwarded request. Dropping it decrements the
/// in-flight count and refreshes the idle clock.
pub struct InFlightGuard {
    entry: Arc<ModelEntry>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.entry.touch_activity();
        gauge!("llmfleet_in_flight", "model" => self.entry.name.clone())
            .set(prev.saturating_sub(1) as f64);
    }
}
