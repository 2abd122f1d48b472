use anyhow::Result;
use chrono::Utc;
use replab_core::Store;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Lock files currently held by this process. A hard exit skips destructors,
/// so the interrupt handler releases whatever is still registered here.
#[derive(Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<BTreeMap<PathBuf, Arc<dyn Store>>>>,
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("held", &self.held_paths())
            .finish()
    }
}

impl LockRegistry {
    fn insert(&self, store: &Arc<dyn Store>, path: &Path) {
        if let Ok(mut held) = self.held.lock() {
            held.insert(path.to_path_buf(), Arc::clone(store));
        }
    }

    fn forget(&self, path: &Path) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(path);
        }
    }

    pub fn held_paths(&self) -> Vec<PathBuf> {
        self.held
            .lock()
            .map(|held| held.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every registered lock file and returns how many went away.
    pub fn release_all(&self) -> usize {
        let drained = match self.held.lock() {
            Ok(mut held) => std::mem::take(&mut *held),
            Err(_) => return 0,
        };
        drained
            .into_iter()
            .filter(|(path, store)| store.remove_file(path).is_ok())
            .count()
    }
}

/// Exclusive marker file; removed when dropped, including on unwinding and
/// on cancellation.
pub struct OperationLock {
    store: Arc<dyn Store>,
    path: PathBuf,
    registry: LockRegistry,
}

impl fmt::Debug for OperationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationLock").field("path", &self.path).finish()
    }
}

impl OperationLock {
    /// `Ok(None)` when a running operation already holds `path`. A lock left
    /// behind by a process that is no longer running is reclaimed.
    pub fn try_acquire(
        store: &Arc<dyn Store>,
        path: &Path,
        label: &str,
        registry: &LockRegistry,
    ) -> Result<Option<Self>> {
        let payload = json!({
            "pid": std::process::id(),
            "label": label,
            "acquired_at": Utc::now().to_rfc3339(),
        });
        let bytes = serde_json::to_vec(&payload)?;
        if store.create_new(path, &bytes)? {
            return Ok(Some(Self::registered(store, path, registry)));
        }
        let Some((pid, contents)) = stale_holder(store.as_ref(), path) else {
            return Ok(None);
        };
        // only remove the exact lock judged stale, not one recreated since
        if store.read(path).ok().as_deref() != Some(contents.as_slice()) {
            return Ok(None);
        }
        warn!(
            lock = %path.display(),
            pid,
            "reclaiming lock left by a process that is no longer running"
        );
        store.remove_file(path)?;
        if store.create_new(path, &bytes)? {
            Ok(Some(Self::registered(store, path, registry)))
        } else {
            Ok(None)
        }
    }

    fn registered(store: &Arc<dyn Store>, path: &Path, registry: &LockRegistry) -> Self {
        registry.insert(store, path);
        Self {
            store: Arc::clone(store),
            path: path.to_path_buf(),
            registry: registry.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        self.registry.forget(&self.path);
        let _ = self.store.remove_file(&self.path);
    }
}

/// Pid and raw contents of a lock whose holder is another process that has
/// exited. Unreadable locks are never considered stale.
fn stale_holder(store: &dyn Store, path: &Path) -> Option<(u32, Vec<u8>)> {
    let contents = store.read(path).ok()?;
    let value: Value = serde_json::from_slice(&contents).ok()?;
    let pid = u32::try_from(value.get("pid")?.as_u64()?).ok()?;
    if pid == std::process::id() || pid_alive(pid) {
        return None;
    }
    Some((pid, contents))
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Who holds `path`, for error messages.
pub fn describe_holder(store: &dyn Store, path: &Path) -> String {
    let Ok(bytes) = store.read(path) else {
        return format!("{} (holder unknown)", path.display());
    };
    let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
        return format!("{} (holder unknown)", path.display());
    };
    format!(
        "{} (pid {}, {}, since {})",
        path.display(),
        value.get("pid").and_then(|v| v.as_u64()).unwrap_or(0),
        value.get("label").and_then(|v| v.as_str()).unwrap_or("?"),
        value.get("acquired_at").and_then(|v| v.as_str()).unwrap_or("?"),
    )
}
