//! Filesystem-backed session repository.
//!
//! Each session owns a directory named by its identifier containing a
//! `session.json` metadata file plus the `contract_state/` and `run_state/`
//! sub-directories consumed by the session service. Metadata writes are
//! atomic (write-temp-then-rename) and serialized per session through a
//! bounded lock cache.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::{Uuid, Version};

use cordon_proto::{default_environment, CONTRACT_STATE_DIR, RUN_STATE_DIR, SESSION_FILE_NAME};

pub mod defaults;

pub const ENV_SESSION_LOCK_IDLE_SECONDS: &str = "CORDON_SESSION_LOCK_IDLE_SECONDS";
pub const ENV_SESSION_LOCK_CACHE: &str = "CORDON_SESSION_LOCK_CACHE";

pub const DEFAULT_LOCK_IDLE_SECONDS: f64 = 600.0;
pub const DEFAULT_LOCK_CACHE_LIMIT: usize = 2048;

/// Canonical session identifier: a 128-bit random value rendered as 32
/// lowercase hex characters. Anything that does not normalize to that form
/// is "no session", never coerced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidSessionId> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() != 32 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidSessionId { raw: raw.to_string() });
        }
        let uuid = Uuid::try_parse(&normalized)
            .map_err(|_| InvalidSessionId { raw: raw.to_string() })?;
        if uuid.get_version() != Some(Version::Random) {
            return Err(InvalidSessionId { raw: raw.to_string() });
        }
        Ok(SessionId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        SessionId::parse(&raw)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> String {
        id.0
    }
}

#[derive(Debug, Clone)]
pub struct InvalidSessionId {
    raw: String,
}

impl fmt::Display for InvalidSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session id {:?}", self.raw)
    }
}

impl std::error::Error for InvalidSessionId {}

#[derive(Debug)]
pub enum StoreError {
    /// The identifier is syntactically valid but no metadata exists for it.
    NotFound(String),
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "session not found: {id}"),
            StoreError::Corrupt { path, source } => {
                write!(f, "corrupt session metadata {}: {source}", path.display())
            }
            StoreError::Io { path, source } => {
                write!(f, "session store io error at {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::NotFound(_) => None,
            StoreError::Corrupt { source, .. } => Some(source),
            StoreError::Io { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub created_unix_ms: u64,
    #[serde(default)]
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default)]
    pub ui_state: Map<String, Value>,
}

impl SessionMetadata {
    pub fn new(session_id: SessionId) -> Self {
        let now = now_unix_ms();
        SessionMetadata {
            session_id,
            created_unix_ms: now,
            updated_unix_ms: now,
            environment: default_environment(),
            ui_state: defaults::default_ui_state(),
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub lock_idle_seconds: f64,
    pub lock_cache_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            lock_idle_seconds: DEFAULT_LOCK_IDLE_SECONDS,
            lock_cache_limit: DEFAULT_LOCK_CACHE_LIMIT,
        }
    }
}

impl StoreOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut options = StoreOptions::default();
        if let Some(idle) = read_f64_env(ENV_SESSION_LOCK_IDLE_SECONDS)? {
            options.lock_idle_seconds = idle;
        }
        if let Some(limit) = read_usize_env(ENV_SESSION_LOCK_CACHE)? {
            options.lock_cache_limit = limit;
        }
        Ok(options)
    }
}

fn read_f64_env(name: &str) -> anyhow::Result<Option<f64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: f64 = raw.trim().parse().map_err(|_| {
        anyhow::anyhow!("invalid environment variable {name}={raw:?} (expected a number)")
    })?;
    Ok(Some(value))
}

fn read_usize_env(name: &str) -> anyhow::Result<Option<usize>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: usize = raw.trim().parse().map_err(|_| {
        anyhow::anyhow!("invalid environment variable {name}={raw:?} (expected an integer)")
    })?;
    Ok(Some(value))
}

struct LockEntry {
    gate: Arc<Mutex<()>>,
    refcount: usize,
    last_used: Instant,
}

/// Durable mapping from session identifier to metadata and storage.
pub struct SessionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, LockEntry>>,
    lock_idle: Option<Duration>,
    lock_cache_limit: usize,
}

impl SessionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        SessionStore::open_with_options(root, StoreOptions::default())
    }

    pub fn open_with_options(
        root: impl Into<PathBuf>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| StoreError::io(&root, err))?;
        let lock_idle = if options.lock_idle_seconds > 0.0 {
            Some(Duration::from_secs_f64(options.lock_idle_seconds))
        } else {
            None
        };
        Ok(SessionStore {
            root,
            locks: Mutex::new(HashMap::new()),
            lock_idle,
            lock_cache_limit: options.lock_cache_limit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn metadata_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(SESSION_FILE_NAME)
    }

    /// The directory handed to the session service. Recreates the storage
    /// sub-directories if they were deleted out of band.
    pub fn storage_home(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        let dir = self.session_dir(id);
        for sub in [CONTRACT_STATE_DIR, RUN_STATE_DIR] {
            let path = dir.join(sub);
            std::fs::create_dir_all(&path).map_err(|err| StoreError::io(&path, err))?;
        }
        Ok(dir)
    }

    pub fn create(&self) -> Result<SessionMetadata, StoreError> {
        loop {
            let id = SessionId::generate();
            let dir = self.session_dir(&id);
            if dir.exists() {
                continue;
            }
            std::fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
            let metadata = SessionMetadata::new(id.clone());
            self.with_session_lock(&id, || self.write_metadata_unlocked(&metadata))?;
            self.storage_home(&id)?;
            return Ok(metadata);
        }
    }

    pub fn load(&self, id: &SessionId) -> Result<SessionMetadata, StoreError> {
        let metadata = self.with_session_lock(id, || self.read_metadata_unlocked(id))?;
        self.storage_home(id)?;
        Ok(metadata)
    }

    /// Merge only the supplied fields and persist. `ui_state` is filtered
    /// to the allow-listed keys; unrecognized keys are dropped, and missing
    /// allow-listed keys are re-materialized from their defaults. Passing
    /// neither field just bumps `updated_unix_ms`.
    pub fn update(
        &self,
        id: &SessionId,
        environment: Option<Map<String, Value>>,
        ui_state: Option<Map<String, Value>>,
    ) -> Result<SessionMetadata, StoreError> {
        let metadata = self.with_session_lock(id, || {
            let mut metadata = self.read_metadata_unlocked(id)?;
            if let Some(environment) = environment {
                metadata.environment = environment;
            }
            if let Some(ui_state) = ui_state {
                metadata.ui_state = defaults::filter_ui_state(&ui_state);
            }
            metadata.updated_unix_ms = now_unix_ms();
            self.write_metadata_unlocked(&metadata)?;
            Ok(metadata)
        })?;
        Ok(metadata)
    }

    /// Bump `updated_unix_ms` without touching stored fields.
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.update(id, None, None).map(|_| ())
    }

    /// Cheap existence check, no deserialization.
    pub fn exists(&self, id: &SessionId) -> bool {
        self.metadata_path(id).is_file()
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|err| StoreError::io(&self.root, err))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(id) = SessionId::parse(name) else { continue };
            if self.exists(&id) {
                sessions.push(id);
            }
        }
        sessions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(sessions)
    }

    /// Sessions whose `updated_unix_ms` age exceeds `ttl`. Sessions that
    /// disappear or fail to parse mid-scan are skipped (the latter with a
    /// diagnostic).
    pub fn expired_sessions(&self, ttl: Duration) -> Result<Vec<SessionId>, StoreError> {
        let now = now_unix_ms();
        let ttl_ms: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);
        let mut expired = Vec::new();
        for id in self.list_sessions()? {
            let metadata = match self.load(&id) {
                Ok(metadata) => metadata,
                Err(StoreError::NotFound(_)) => continue,
                Err(err @ StoreError::Corrupt { .. }) => {
                    tracing::warn!(session = %id, error = %err, "skipping unreadable session in TTL scan");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if now.saturating_sub(metadata.updated_unix_ms) >= ttl_ms {
                expired.push(id);
            }
        }
        Ok(expired)
    }

    /// Remove metadata and all storage recursively. Idempotent on missing
    /// sessions.
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.remove(id.as_str());
        }
        let dir = self.session_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                tracing::warn!(session = %id, error = %err, "failed to remove session directory");
                Ok(())
            }
        }
    }

    fn read_metadata_unlocked(&self, id: &SessionId) -> Result<SessionMetadata, StoreError> {
        let path = self.metadata_path(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.as_str().to_string()));
            }
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    // Crash mid-write must never leave a corrupt metadata file: write to a
    // temp file in the same directory, then rename over the target.
    fn write_metadata_unlocked(&self, metadata: &SessionMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(&metadata.session_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(metadata)
            .map_err(|err| StoreError::io(&path, io::Error::new(io::ErrorKind::InvalidData, err)))?;
        std::fs::write(&tmp, payload).map_err(|err| StoreError::io(&tmp, err))?;
        std::fs::rename(&tmp, &path).map_err(|err| StoreError::io(&path, err))
    }

    fn with_session_lock<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let gate = self.checkout_lock(id);
        let result = {
            let _guard = gate.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        self.checkin_lock(id);
        result
    }

    fn checkout_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = locks.entry(id.as_str().to_string()).or_insert_with(|| LockEntry {
            gate: Arc::new(Mutex::new(())),
            refcount: 0,
            last_used: Instant::now(),
        });
        entry.refcount += 1;
        entry.last_used = Instant::now();
        Arc::clone(&entry.gate)
    }

    fn checkin_lock(&self, id: &SessionId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = locks.get_mut(id.as_str()) {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.last_used = Instant::now();
        }
        self.prune_locks(&mut locks, id.as_str());
    }

    // Entries are only removable at refcount zero; capacity pruning evicts
    // the least recently used first.
    fn prune_locks(&self, locks: &mut HashMap<String, LockEntry>, current: &str) {
        if let Some(idle) = self.lock_idle {
            let remove = locks
                .get(current)
                .is_some_and(|e| e.refcount == 0 && e.last_used.elapsed() >= idle);
            if remove {
                locks.remove(current);
            }
        }

        let limit = self.lock_cache_limit;
        if limit == 0 || locks.len() <= limit {
            return;
        }
        let mut candidates: Vec<(Instant, String)> = locks
            .iter()
            .filter(|(id, entry)| entry.refcount == 0 && id.as_str() != current)
            .map(|(id, entry)| (entry.last_used, id.clone()))
            .collect();
        candidates.sort_by_key(|(last_used, _)| *last_used);
        for (_, id) in candidates {
            if locks.len() <= limit {
                break;
            }
            locks.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(tmp.path()).expect("open store");
        (tmp, store)
    }

    #[test]
    fn create_then_load_round_trips() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");
        assert!(store.exists(&created.session_id));

        let loaded = store.load(&created.session_id).expect("load");
        assert_eq!(created, loaded);

        let home = store.storage_home(&created.session_id).expect("home");
        assert!(home.join(CONTRACT_STATE_DIR).is_dir());
        assert!(home.join(RUN_STATE_DIR).is_dir());
    }

    #[test]
    fn session_id_validation() {
        let id = SessionId::generate();
        assert_eq!(SessionId::parse(id.as_str()).unwrap(), id);

        let upper = id.as_str().to_ascii_uppercase();
        assert_eq!(SessionId::parse(&upper).unwrap(), id);

        // 32 hex chars but not a v4 value.
        assert!(SessionId::parse("deadbeefdeadbeefdeadbeefdeadbeef").is_err());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("not-a-session").is_err());
        assert!(SessionId::parse(&id.as_str()[..31]).is_err());
    }

    #[test]
    fn update_environment_leaves_ui_state_untouched() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");
        let ui_before = serde_json::to_vec(&created.ui_state).expect("encode");

        let mut env = Map::new();
        env.insert("signer".to_string(), Value::from("tester"));
        store
            .update(&created.session_id, Some(env), None)
            .expect("update");

        let loaded = store.load(&created.session_id).expect("load");
        assert_eq!(loaded.environment["signer"], "tester");
        let ui_after = serde_json::to_vec(&loaded.ui_state).expect("encode");
        assert_eq!(ui_before, ui_after);
        assert!(loaded.updated_unix_ms >= created.updated_unix_ms);
    }

    #[test]
    fn ui_state_update_drops_unrecognized_keys() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");

        let mut ui = Map::new();
        ui.insert("contract_name".to_string(), Value::from("con_test"));
        ui.insert("unrecognized_key".to_string(), Value::from("x"));
        store
            .update(&created.session_id, None, Some(ui))
            .expect("update");

        let loaded = store.load(&created.session_id).expect("load");
        assert_eq!(loaded.ui_state["contract_name"], "con_test");
        assert!(!loaded.ui_state.contains_key("unrecognized_key"));
        // Missing allow-listed keys come back as defaults.
        assert_eq!(loaded.ui_state["kwargs_input"], "{}");
    }

    #[test]
    fn touch_bumps_updated_without_mutating_fields() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");

        std::thread::sleep(Duration::from_millis(5));
        store.touch(&created.session_id).expect("touch");

        let loaded = store.load(&created.session_id).expect("load");
        assert!(loaded.updated_unix_ms > created.updated_unix_ms);
        assert_eq!(loaded.environment, created.environment);
        assert_eq!(loaded.ui_state, created.ui_state);
    }

    #[test]
    fn load_missing_session_is_not_found() {
        let (_tmp, store) = store();
        let id = SessionId::generate();
        match store.load(&id) {
            Err(StoreError::NotFound(raw)) => assert_eq!(raw, id.as_str()),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");
        store.delete(&created.session_id).expect("delete");
        assert!(!store.exists(&created.session_id));
        store.delete(&created.session_id).expect("delete again");
    }

    #[test]
    fn list_sessions_skips_foreign_directories() {
        let (tmp, store) = store();
        let a = store.create().expect("create");
        let b = store.create().expect("create");
        std::fs::create_dir(tmp.path().join("not-a-session")).expect("mkdir");

        let mut expected = vec![a.session_id, b.session_id];
        expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(store.list_sessions().expect("list"), expected);
    }

    #[test]
    fn expired_sessions_respect_ttl() {
        let (_tmp, store) = store();
        let old = store.create().expect("create");
        let fresh = store.create().expect("create");

        // Age the first session by rewriting its metadata with an old stamp.
        let mut metadata = store.load(&old.session_id).expect("load");
        metadata.updated_unix_ms = now_unix_ms().saturating_sub(60_000);
        store.write_metadata_unlocked(&metadata).expect("rewrite");

        let expired = store.expired_sessions(Duration::from_secs(30)).expect("scan");
        assert_eq!(expired, vec![old.session_id.clone()]);
        assert!(!expired.contains(&fresh.session_id));
    }

    #[test]
    fn storage_home_self_heals_missing_directories() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");
        let home = store.storage_home(&created.session_id).expect("home");
        std::fs::remove_dir_all(home.join(CONTRACT_STATE_DIR)).expect("remove");

        store.load(&created.session_id).expect("load");
        assert!(home.join(CONTRACT_STATE_DIR).is_dir());
    }

    #[test]
    fn lock_cache_is_bounded() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open_with_options(
            tmp.path(),
            StoreOptions {
                lock_idle_seconds: DEFAULT_LOCK_IDLE_SECONDS,
                lock_cache_limit: 1,
            },
        )
        .expect("open store");

        for _ in 0..4 {
            store.create().expect("create");
        }
        let locks = store.locks.lock().unwrap();
        assert!(locks.len() <= 2, "lock cache grew to {}", locks.len());
    }

    #[test]
    fn corrupt_metadata_is_reported() {
        let (_tmp, store) = store();
        let created = store.create().expect("create");
        let path = store.metadata_path(&created.session_id);
        std::fs::write(&path, b"{not json").expect("scribble");

        match store.load(&created.session_id) {
            Err(StoreError::Corrupt { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
