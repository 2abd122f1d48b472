use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// The directory tree an experiment lives in.
///
/// Every artifact the auditor treats as a completion signal goes through
/// `atomic_write`, so a reader observes either the previous bytes or the new
/// bytes, never a truncated file.
pub trait Store: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Sorted names of the immediate children of `dir`; empty when `dir` is absent.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    /// Creates `path` with `bytes` only if nothing exists there yet.
    /// Returns `false` when the path was already taken.
    fn create_new(&self, path: &Path, bytes: &[u8]) -> Result<bool>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn delete_subtree(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Removes leftover temp files below `dir`, returning how many were removed.
    fn sweep_temp(&self, dir: &Path) -> Result<usize>;

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|_| anyhow!("not utf-8: {}", path.display()))
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn temp_name(name: &str) -> String {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        ".{}.tmp.{}.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros(),
        seq
    )
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

#[derive(Debug, Clone, Default)]
pub struct FsStore;

impl FsStore {
    pub fn new() -> Self {
        Self
    }
}

impl Store for FsStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| anyhow!("read {}: {}", path.display(), e))
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("tmpfile");
        let tmp = path.with_file_name(temp_name(name));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn create_new(&self, path: &Path, bytes: &[u8]) -> Result<bool> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let _ = file.write_all(bytes);
                let _ = file.sync_all();
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_subtree(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn sweep_temp(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_temp_name(&name) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Default)]
struct MemInner {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    fail_writes: BTreeSet<String>,
    write_log: Vec<PathBuf>,
}

impl MemInner {
    fn add_dir(&mut self, path: &Path) {
        let mut cur = Some(path);
        while let Some(p) = cur {
            if p.as_os_str().is_empty() {
                break;
            }
            self.dirs.insert(p.to_path_buf());
            cur = p.parent();
        }
    }
}

/// In-memory store used by state-machine tests.
///
/// Writes to file names registered with [`MemStore::fail_writes_named`] fail
/// before anything is committed, which is how an interrupted write looks
/// through `atomic_write`.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_named(&self, file_name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes.insert(file_name.to_string());
        }
    }

    pub fn clear_write_failures(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_writes.clear();
        }
    }

    /// Every path mutated so far, in order.
    pub fn write_log(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .map(|inner| inner.write_log.clone())
            .unwrap_or_default()
    }

    pub fn clear_write_log(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.write_log.clear();
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl Store for MemStore {
    fn exists(&self, path: &Path) -> bool {
        self.lock()
            .map(|inner| inner.files.contains_key(path) || inner.dirs.contains(path))
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.lock()
            .map(|inner| inner.dirs.contains(path))
            .unwrap_or(false)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut names = BTreeSet::new();
        for path in inner.files.keys().chain(inner.dirs.iter()) {
            if path.parent() == Some(dir) {
                names.insert(file_name_of(path));
            }
        }
        Ok(names.into_iter().collect())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("read {}: not found", path.display()))
    }

    fn atomic_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes.contains(&file_name_of(path)) {
            return Err(anyhow!("injected write failure: {}", path.display()));
        }
        if let Some(parent) = path.parent() {
            inner.add_dir(parent);
        }
        inner.files.insert(path.to_path_buf(), bytes.to_vec());
        inner.write_log.push(path.to_path_buf());
        Ok(())
    }

    fn append(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(parent) = path.parent() {
            inner.add_dir(parent);
        }
        inner
            .files
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(bytes);
        inner.write_log.push(path.to_path_buf());
        Ok(())
    }

    fn create_new(&self, path: &Path, bytes: &[u8]) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.files.contains_key(path) || inner.dirs.contains(path) {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            inner.add_dir(parent);
        }
        inner.files.insert(path.to_path_buf(), bytes.to_vec());
        inner.write_log.push(path.to_path_buf());
        Ok(true)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.files.remove(path).is_some() {
            inner.write_log.push(path.to_path_buf());
        }
        Ok(())
    }

    fn delete_subtree(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock()?;
        inner.files.retain(|p, _| !p.starts_with(path));
        inner.dirs.retain(|p| !p.starts_with(path));
        inner.write_log.push(path.to_path_buf());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock()?;
        inner.add_dir(path);
        Ok(())
    }

    fn sweep_temp(&self, dir: &Path) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.files.len();
        inner
            .files
            .retain(|p, _| !(p.starts_with(dir) && is_temp_name(&file_name_of(p))));
        Ok(before - inner.files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "replab_store_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn fs_atomic_write_replaces_without_leaving_temp_files() {
        let dir = scratch("atomic");
        let store = FsStore::new();
        let target = dir.join("run_1").join("replication_report.txt");
        store.atomic_write(&target, b"old").expect("first write");
        store.atomic_write(&target, b"new").expect("second write");
        assert_eq!(store.read(&target).expect("read"), b"new");
        let names = store.list(&dir.join("run_1")).expect("list");
        assert_eq!(names, vec!["replication_report.txt".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_create_new_is_exclusive() {
        let dir = scratch("create_new");
        let store = FsStore::new();
        let lock = dir.join(".locks").join("run_1.lock");
        assert!(store.create_new(&lock, b"a").expect("first"));
        assert!(!store.create_new(&lock, b"b").expect("second"));
        store.remove_file(&lock).expect("remove");
        assert!(store.create_new(&lock, b"c").expect("third"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_sweep_removes_only_temp_files() {
        let dir = scratch("sweep");
        let store = FsStore::new();
        fs::write(dir.join(".response_1.txt.tmp.1.2.3"), b"partial").expect("temp");
        fs::write(dir.join("response_1.txt"), b"kept").expect("real");
        assert_eq!(store.sweep_temp(&dir).expect("sweep"), 1);
        assert_eq!(store.list(&dir).expect("list"), vec!["response_1.txt".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn mem_store_lists_files_and_dirs() {
        let store = MemStore::new();
        let exp = PathBuf::from("/exp");
        store
            .atomic_write(&exp.join("run_1").join("query_1.txt"), b"q")
            .expect("write");
        store.create_dir_all(&exp.join("run_2")).expect("dir");
        assert_eq!(
            store.list(&exp).expect("list"),
            vec!["run_1".to_string(), "run_2".to_string()]
        );
        assert!(store.is_dir(&exp.join("run_1")));
        store.delete_subtree(&exp.join("run_1")).expect("delete");
        assert!(!store.exists(&exp.join("run_1").join("query_1.txt")));
        assert_eq!(store.list(&exp).expect("list"), vec!["run_2".to_string()]);
    }

    #[test]
    fn mem_store_injected_failure_keeps_previous_bytes() {
        let store = MemStore::new();
        let report = PathBuf::from("/exp/run_1/replication_report.txt");
        store.atomic_write(&report, b"old").expect("write");
        store.fail_writes_named("replication_report.txt");
        assert!(store.atomic_write(&report, b"new").is_err());
        assert_eq!(store.read(&report).expect("read"), b"old");
    }
}
