//! Session runtime manager.
//!
//! Maps session identifiers to resident worker entries, creates workers
//! lazily, runs a background reaper that retires idle workers and expired
//! sessions, and enforces the resident-worker cap by evicting the oldest
//! idle entry. Per session the state machine is
//! `absent -> resident(idle) <-> resident(busy) -> absent`; busy entries are
//! never evicted, and a dead worker is replaced transparently on the next
//! call.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use cordon_proto::{ContractDetails, ExportInfo};
use cordon_store::{defaults, SessionId, SessionMetadata, SessionStore};
use cordon_worker::{InvokeHooks, ServiceProxy, Worker, WorkerFactory};

mod config;
mod error;

pub use config::{
    RuntimeConfig, DEFAULT_MAX_IDLE_SECONDS, DEFAULT_MAX_RESIDENT_WORKERS,
    DEFAULT_REAPER_INTERVAL_SECONDS, DEFAULT_RPC_TIMEOUT_SECONDS, DEFAULT_SESSION_TTL_SECONDS,
    DEFAULT_WORKER_STOP_TIMEOUT_SECONDS, ENV_MAX_IDLE_SECONDS, ENV_MAX_RESIDENT_WORKERS,
    ENV_REAPER_INTERVAL_SECONDS, ENV_RPC_TIMEOUT_SECONDS, ENV_SESSION_TTL_SECONDS,
    ENV_WORKER_STOP_TIMEOUT_SECONDS,
};
pub use error::RuntimeError;

struct EntryState {
    inflight: u32,
    last_used: Instant,
}

/// Inflight/idle bookkeeping for one resident entry. Has its own lock so
/// waiting for one session to drain never blocks progress on another.
struct EntryStats {
    state: Mutex<EntryState>,
    idle: Condvar,
}

impl EntryStats {
    fn new() -> Self {
        EntryStats {
            state: Mutex::new(EntryState { inflight: 0, last_used: Instant::now() }),
            idle: Condvar::new(),
        }
    }

    fn mark_used(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_used = Instant::now();
    }

    fn snapshot(&self) -> (u32, Instant) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.inflight, state.last_used)
    }

    fn is_idle_for(&self, max_idle: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inflight == 0 && state.last_used.elapsed() >= max_idle
    }

    /// Block until inflight reaches zero or `timeout` elapses.
    fn wait_for_idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, wait) = self
            .idle
            .wait_timeout_while(state, timeout, |s| s.inflight > 0)
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        !wait.timed_out()
    }
}

impl InvokeHooks for EntryStats {
    fn before_invoke(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inflight += 1;
        state.last_used = Instant::now();
    }

    fn after_invoke(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inflight = state.inflight.saturating_sub(1);
        state.last_used = Instant::now();
        if state.inflight == 0 {
            self.idle.notify_all();
        }
    }
}

/// One resident worker: the worker, its proxy, and its bookkeeping,
/// created together and destroyed together. Never shared across sessions.
struct Entry {
    worker: Arc<dyn Worker>,
    proxy: ServiceProxy,
    stats: Arc<EntryStats>,
}

struct ReaperHandle {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Coordinates per-session service instances and metadata. Explicitly
/// constructed and explicitly shut down by the host's top-level lifecycle;
/// there is no global instance and no exit hook.
pub struct SessionRuntime {
    store: Arc<SessionStore>,
    factory: Box<dyn WorkerFactory>,
    config: RuntimeConfig,
    entries: Mutex<HashMap<SessionId, Arc<Entry>>>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl SessionRuntime {
    pub fn new(
        store: Arc<SessionStore>,
        factory: Box<dyn WorkerFactory>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let runtime = Arc::new(SessionRuntime {
            store,
            factory,
            config,
            entries: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
        });
        if let Some(interval) = config.reaper_interval {
            if config.max_idle.is_some() || config.session_ttl.is_some() {
                runtime.start_reaper(interval);
            }
        }
        runtime
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Parse a raw identifier from an untrusted caller. Absent or malformed
    /// identifiers are "no session".
    pub fn parse_id(raw: Option<&str>) -> Result<SessionId, RuntimeError> {
        let raw = raw.unwrap_or("");
        SessionId::parse(raw).map_err(|_| RuntimeError::SessionNotFound(raw.to_string()))
    }

    /// Return existing metadata for the identifier, or create a fresh
    /// session when permitted. The boolean reports whether a session was
    /// created. Never creates when `create_if_missing` is false.
    pub fn resolve_or_create(
        &self,
        raw: Option<&str>,
        create_if_missing: bool,
    ) -> Result<(SessionMetadata, bool), RuntimeError> {
        if let Ok(id) = Self::parse_id(raw) {
            match self.store.load(&id) {
                Ok(metadata) => return Ok((metadata, false)),
                Err(cordon_store::StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !create_if_missing {
            return Err(RuntimeError::SessionNotFound(raw.unwrap_or("").to_string()));
        }
        Ok((self.store.create()?, true))
    }

    pub fn create_session(&self) -> Result<SessionMetadata, RuntimeError> {
        Ok(self.store.create()?)
    }

    pub fn ensure_exists(&self, id: &SessionId) -> Result<SessionMetadata, RuntimeError> {
        Ok(self.store.load(id)?)
    }

    pub fn session_exists(&self, id: &SessionId) -> bool {
        self.store.exists(id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionId>, RuntimeError> {
        Ok(self.store.list_sessions()?)
    }

    pub fn get_ui_state(&self, id: &SessionId) -> Result<Map<String, Value>, RuntimeError> {
        Ok(self.ensure_exists(id)?.ui_state)
    }

    pub fn save_ui_state(
        &self,
        id: &SessionId,
        ui_state: Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        self.store.update(id, None, Some(ui_state))?;
        Ok(())
    }

    pub fn get_environment(&self, id: &SessionId) -> Result<Map<String, Value>, RuntimeError> {
        let entry = self.entry(id)?;
        Ok(entry.proxy.get_environment()?)
    }

    pub fn get_environment_snapshot(
        &self,
        id: &SessionId,
    ) -> Result<Map<String, Value>, RuntimeError> {
        let entry = self.entry(id)?;
        Ok(entry.proxy.snapshot_environment()?)
    }

    /// Persist the service's current environment into the session metadata.
    pub fn update_environment_snapshot(&self, id: &SessionId) -> Result<(), RuntimeError> {
        let entry = self.entry(id)?;
        let snapshot = entry.proxy.snapshot_environment()?;
        self.store.update(id, Some(snapshot), None)?;
        Ok(())
    }

    pub fn set_environment_var(
        &self,
        id: &SessionId,
        key: &str,
        value: Value,
    ) -> Result<Value, RuntimeError> {
        let entry = self.entry(id)?;
        let coerced = entry.proxy.set_environment_var(key, value)?;
        self.persist_environment(id, &entry)?;
        Ok(coerced)
    }

    pub fn remove_environment_var(&self, id: &SessionId, key: &str) -> Result<(), RuntimeError> {
        let entry = self.entry(id)?;
        entry.proxy.remove_environment_var(key)?;
        self.persist_environment(id, &entry)
    }

    pub fn set_signer(&self, id: &SessionId, signer: &str) -> Result<String, RuntimeError> {
        let entry = self.entry(id)?;
        let updated = entry.proxy.set_signer(signer)?;
        self.persist_environment(id, &entry)?;
        Ok(updated)
    }

    pub fn deploy(&self, id: &SessionId, name: &str, code: &str) -> Result<(), RuntimeError> {
        if name.trim().is_empty() {
            return Err(RuntimeError::invalid("Contract name cannot be empty."));
        }
        if code.trim().is_empty() {
            return Err(RuntimeError::invalid("Contract code cannot be empty."));
        }
        let entry = self.entry(id)?;
        Ok(entry.proxy.deploy(name, code)?)
    }

    pub fn list_contracts(&self, id: &SessionId) -> Result<Vec<String>, RuntimeError> {
        let entry = self.entry(id)?;
        Ok(entry.proxy.list_contracts()?)
    }

    pub fn get_export_metadata(
        &self,
        id: &SessionId,
        contract: &str,
    ) -> Result<Vec<ExportInfo>, RuntimeError> {
        if contract.trim().is_empty() {
            return Err(RuntimeError::invalid("Contract name is required."));
        }
        let entry = self.entry(id)?;
        Ok(entry.proxy.get_export_metadata(contract)?)
    }

    pub fn get_contract_details(
        &self,
        id: &SessionId,
        contract: &str,
    ) -> Result<ContractDetails, RuntimeError> {
        if contract.trim().is_empty() {
            return Err(RuntimeError::invalid("Contract name is required."));
        }
        let entry = self.entry(id)?;
        Ok(entry.proxy.get_contract_details(contract)?)
    }

    pub fn call(
        &self,
        id: &SessionId,
        contract: &str,
        function: &str,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RuntimeError> {
        if contract.trim().is_empty() {
            return Err(RuntimeError::invalid("No contract selected."));
        }
        if function.trim().is_empty() {
            return Err(RuntimeError::invalid("No function selected."));
        }
        let entry = self.entry(id)?;
        Ok(entry.proxy.call(contract, function, kwargs)?)
    }

    pub fn dump_state(&self, id: &SessionId, show_internal: bool) -> Result<String, RuntimeError> {
        let entry = self.entry(id)?;
        Ok(entry.proxy.dump_state(show_internal)?)
    }

    pub fn apply_state_snapshot(
        &self,
        id: &SessionId,
        snapshot: &Value,
    ) -> Result<(), RuntimeError> {
        let Value::Object(snapshot) = snapshot else {
            return Err(RuntimeError::invalid("State snapshot must be a JSON object."));
        };
        let entry = self.entry(id)?;
        Ok(entry.proxy.apply_state_snapshot(snapshot)?)
    }

    pub fn remove_contract(&self, id: &SessionId, name: &str) -> Result<(), RuntimeError> {
        if name.trim().is_empty() {
            return Err(RuntimeError::invalid("Contract name is required."));
        }
        let entry = self.entry(id)?;
        Ok(entry.proxy.remove_contract(name)?)
    }

    /// Reset the service and persist fresh default metadata around the
    /// service's (now default) environment snapshot.
    pub fn reset_state(&self, id: &SessionId) -> Result<SessionMetadata, RuntimeError> {
        let entry = self.entry(id)?;
        entry.proxy.reset_state()?;
        let environment = entry.proxy.snapshot_environment()?;
        let metadata =
            self.store.update(id, Some(environment), Some(defaults::default_ui_state()))?;
        Ok(metadata)
    }

    /// Stop and forget the session's resident worker, if any. On-disk state
    /// is untouched.
    pub fn close_session(&self, id: &SessionId) {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(id)
        };
        if let Some(entry) = entry {
            self.stop_entry(&entry);
        }
    }

    /// Intended to run once at process exit: stops the reaper first, then
    /// every resident worker.
    pub fn shutdown(&self) {
        self.stop_reaper();
        let drained: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            self.stop_entry(&entry);
        }
    }

    pub fn resident_workers(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn reaper_running(&self) -> bool {
        self.reaper.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn entry(&self, id: &SessionId) -> Result<Arc<Entry>, RuntimeError> {
        let entry = self.get_or_create_entry(id)?;
        entry.stats.mark_used();
        Ok(entry)
    }

    fn get_or_create_entry(&self, id: &SessionId) -> Result<Arc<Entry>, RuntimeError> {
        let stale = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let resident_is_dead = match entries.get(id) {
                Some(entry) if !entry.worker.is_dead() => return Ok(Arc::clone(entry)),
                Some(_) => true,
                None => false,
            };
            if resident_is_dead {
                tracing::warn!(session = %id, "dropping dead session worker; recreating");
                entries.remove(id)
            } else {
                None
            }
        };
        if let Some(stale) = stale {
            self.stop_entry(&stale);
        }

        // Spawn and hydrate outside the table lock; it is slow.
        let fresh = Arc::new(self.create_entry(id)?);

        let mut lost_race = false;
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = entries.get(id) {
                lost_race = true;
                Arc::clone(existing)
            } else {
                entries.insert(id.clone(), Arc::clone(&fresh));
                Arc::clone(&fresh)
            }
        };
        if lost_race {
            self.stop_entry(&fresh);
        } else {
            self.trim_workers_if_needed(id);
        }
        Ok(entry)
    }

    fn create_entry(&self, id: &SessionId) -> Result<Entry, RuntimeError> {
        let metadata = self.store.load(id)?;
        let storage_home = self.store.storage_home(id)?;
        let worker = self.factory.spawn_worker(&storage_home)?;
        let stats = Arc::new(EntryStats::new());
        let proxy = ServiceProxy::new(
            Arc::clone(&worker),
            Some(Arc::clone(&stats) as Arc<dyn InvokeHooks>),
        );
        // No half-initialized entry: the persisted environment goes in
        // before the entry becomes visible to anyone else.
        if let Err(err) = proxy.hydrate_environment(&metadata.environment) {
            worker.stop();
            return Err(err.into());
        }
        Ok(Entry { worker, proxy, stats })
    }

    fn persist_environment(&self, id: &SessionId, entry: &Entry) -> Result<(), RuntimeError> {
        let snapshot = entry.proxy.snapshot_environment()?;
        self.store.update(id, Some(snapshot), None)?;
        Ok(())
    }

    // The entry just created for `admitted` is never the victim; eviction
    // makes room among the pre-existing idle entries.
    fn trim_workers_if_needed(&self, admitted: &SessionId) {
        let Some(limit) = self.config.max_resident_workers else { return };
        let mut victims: Vec<Arc<Entry>> = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let mut surplus = entries.len().saturating_sub(limit);
            if surplus == 0 {
                return;
            }
            let mut idle: Vec<(Instant, SessionId)> = entries
                .iter()
                .filter(|(id, _)| id.as_str() != admitted.as_str())
                .filter_map(|(id, entry)| {
                    let (inflight, last_used) = entry.stats.snapshot();
                    (inflight == 0).then(|| (last_used, id.clone()))
                })
                .collect();
            idle.sort_by_key(|(last_used, _)| *last_used);
            for (_, id) in idle {
                if surplus == 0 {
                    break;
                }
                if let Some(entry) = entries.remove(&id) {
                    victims.push(entry);
                    surplus -= 1;
                }
            }
            if surplus > 0 {
                // Soft cap: admit over the limit rather than block or evict
                // a busy entry.
                tracing::warn!(
                    limit,
                    resident = entries.len(),
                    "unable to evict enough idle workers to honor {ENV_MAX_RESIDENT_WORKERS}"
                );
            }
        }
        for entry in victims {
            self.stop_entry(&entry);
        }
    }

    fn stop_entry(&self, entry: &Entry) {
        if !entry.stats.wait_for_idle(self.config.worker_stop_timeout) {
            tracing::warn!("timed out waiting for session worker to drain; forcing stop");
        }
        entry.worker.stop();
    }

    fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, stop_rx) = mpsc::channel();
        let runtime = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("cordon-session-reaper".to_string())
            .spawn(move || reaper_loop(&runtime, &stop_rx, interval));
        match spawned {
            Ok(thread) => {
                let mut reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
                *reaper = Some(ReaperHandle { stop_tx, thread });
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to start session reaper thread");
            }
        }
    }

    fn stop_reaper(&self) {
        let handle = {
            let mut reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
            reaper.take()
        };
        if let Some(ReaperHandle { stop_tx, thread }) = handle {
            let _ = stop_tx.send(());
            // The final Arc can be dropped by the reaper itself mid-sweep;
            // joining our own thread would never return.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }

    fn reap_idle_workers(&self) {
        let Some(max_idle) = self.config.max_idle else { return };
        let victims: Vec<Arc<Entry>> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let idle_ids: Vec<SessionId> = entries
                .iter()
                .filter(|(_, entry)| entry.stats.is_idle_for(max_idle))
                .map(|(id, _)| id.clone())
                .collect();
            idle_ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
        };
        for entry in victims {
            self.stop_entry(&entry);
        }
    }

    fn reap_expired_sessions(&self) {
        let Some(ttl) = self.config.session_ttl else { return };
        let expired = match self.store.expired_sessions(ttl) {
            Ok(expired) => expired,
            Err(err) => {
                tracing::error!(error = %err, "session TTL scan failed");
                return;
            }
        };
        for id in expired {
            tracing::info!(session = %id, "expiring session past TTL");
            self.close_session(&id);
            if let Err(err) = self.store.delete(&id) {
                tracing::error!(session = %id, error = %err, "failed to delete expired session");
            }
        }
    }

    fn sweep(&self) {
        self.reap_idle_workers();
        self.reap_expired_sessions();
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Failures inside a sweep are logged by the individual steps; the loop
// itself only exits on the stop signal or when the runtime is gone.
fn reaper_loop(runtime: &Weak<SessionRuntime>, stop_rx: &mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(runtime) = runtime.upgrade() else { break };
        runtime.sweep();
    }
}
