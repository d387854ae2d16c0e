//! Local filesystem storage implementation.
//!
//! Backs every external contract with plain JSON files so the indexer can
//! run without a database or search server. Writes go to a uniquely named
//! temp file and are renamed into place.
//!
//! Several indexer processes may share one directory. Lock-table updates
//! run under an exclusive advisory lock on `locks.lock`, so the
//! read-modify-write of `locks.json` is atomic across processes.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── locks.json                 # Lock table
//! ├── locks.lock                 # Advisory lock guarding locks.json
//! ├── records/{id}.json          # RecordSource
//! ├── cursors/{name}.json        # CursorStore
//! ├── index/{record}/{offset}.json  # SearchSink, SearchIndex
//! └── rules/
//!     ├── current.json           # RuleStore: rules the index reflects
//!     └── run.json               # RuleStore: unfinished recheck
//! ```

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::lock::{Lock, LockStore};
use crate::models::{Record, SearchDocument};
use crate::rules::{AccessControl, AccessRule};
use crate::storage::{
    CursorState, CursorStore, RecordSource, RuleFeed, RuleRun, RuleStore, SearchIndex, SearchSink,
};

const LOCKS_KEY: &str = "locks.json";
const RULES_KEY: &str = "rules/current.json";
const RULE_RUN_KEY: &str = "rules/run.json";
const LOCKS_GUARD: &str = "locks.lock";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

type LockTable = BTreeMap<String, Lock>;

/// Temp file next to `path`, unique per process and write.
fn tmp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}

/// Run `update` on the lock table while holding the cross-process guard.
///
/// `update` returns its result and whether the table must be written back.
fn lock_table_transaction<T>(
    root: &Path,
    update: impl FnOnce(&mut LockTable) -> (T, bool),
) -> Result<T> {
    std::fs::create_dir_all(root)?;
    let guard_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(root.join(LOCKS_GUARD))?;
    let mut guard = fd_lock::RwLock::new(guard_file);
    let _held = guard.write()?;

    let path = root.join(LOCKS_KEY);
    let mut table: LockTable = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == ErrorKind::NotFound => LockTable::new(),
        Err(e) => return Err(AppError::Io(e)),
    };

    let (result, dirty) = update(&mut table);
    if dirty {
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, serde_json::to_vec_pretty(&table)?)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(AppError::Io(e));
        }
    }
    Ok(result)
}

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    // Keeps this process's lock-table transactions off the blocking pool
    // while another one holds the file lock
    lock_table: Mutex<()>,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            lock_table: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = tmp_path(&path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::Io(e));
        }
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record_key(record_id: u64) -> String {
        format!("records/{}.json", record_id)
    }

    fn cursor_key(name: &str) -> String {
        format!("cursors/{}.json", name)
    }

    fn index_key(record_id: u64, offset: u64) -> String {
        format!("index/{}/{}.json", record_id, offset)
    }

    /// Store a record so it can be fetched later.
    pub async fn save_record(&self, record: &Record) -> Result<()> {
        self.write_json(&Self::record_key(record.id), record).await
    }

    /// Read back a committed search document.
    pub async fn load_committed(
        &self,
        record_id: u64,
        offset: u64,
    ) -> Result<Option<SearchDocument>> {
        self.read_json(&Self::index_key(record_id, offset)).await
    }

    /// All persisted cursors, sorted by name.
    pub async fn list_cursors(&self) -> Result<Vec<CursorState>> {
        let mut cursors = Vec::new();
        for name in self.list_stems("cursors").await? {
            if let Some(state) = self.read_json::<CursorState>(&Self::cursor_key(&name)).await? {
                cursors.push(state);
            }
        }
        cursors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(cursors)
    }

    /// File stems of the `.json` files in a directory; empty if it is missing.
    async fn list_stems(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.path(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        Ok(stems)
    }

    /// Every committed document, ordered by record and offset.
    pub async fn committed_documents(&self) -> Result<Vec<SearchDocument>> {
        let mut records = match tokio::fs::read_dir(self.path("index")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut documents = Vec::new();
        while let Some(entry) = records.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(record) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let dir = format!("index/{}", record);
            for stem in self.list_stems(&dir).await? {
                let key = format!("{}/{}.json", dir, stem);
                if let Some(document) = self.read_json::<SearchDocument>(&key).await? {
                    documents.push(document);
                }
            }
        }
        documents.sort_by_key(|d| (d.record_id, d.offset));
        Ok(documents)
    }

    async fn find_committed(
        &self,
        matches: impl Fn(&SearchDocument) -> bool,
    ) -> Result<Vec<SearchDocument>> {
        let mut documents = self.committed_documents().await?;
        documents.retain(|d| matches(d));
        Ok(documents)
    }

    async fn read_locks(&self) -> Result<LockTable> {
        Ok(self.read_json(LOCKS_KEY).await?.unwrap_or_default())
    }

    /// Apply `update` to the lock table atomically with respect to every
    /// process sharing this directory.
    async fn update_locks<T, F>(&self, update: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LockTable) -> (T, bool) + Send + 'static,
    {
        let _table = self.lock_table.lock().await;
        let root = self.root_dir.clone();
        tokio::task::spawn_blocking(move || lock_table_transaction(&root, update))
            .await
            .map_err(|e| AppError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl RecordSource for LocalStorage {
    async fn fetch_batch(&self, record_id: u64) -> Result<Option<Record>> {
        let record: Option<Record> = self.read_json(&Self::record_key(record_id)).await?;
        if let Some(record) = &record {
            if record.id != record_id {
                return Err(AppError::source_failed(format!(
                    "records/{}.json contains record {}",
                    record_id, record.id
                )));
            }
        }
        Ok(record)
    }

    async fn list_ids(&self, from: u64, limit: usize) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .list_stems("records")
            .await?
            .iter()
            .filter_map(|stem| stem.parse().ok())
            .filter(|id| *id >= from)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }
}

#[async_trait]
impl CursorStore for LocalStorage {
    async fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        let state: Option<CursorState> = self.read_json(&Self::cursor_key(name)).await?;
        Ok(state.map(|s| s.last_id))
    }

    async fn save_cursor(&self, name: &str, last_id: u64) -> Result<()> {
        let state = CursorState {
            name: name.to_string(),
            last_id,
            updated_at: Utc::now(),
        };
        self.write_json(&Self::cursor_key(name), &state).await?;
        log::debug!("Cursor '{}' persisted at {}", name, last_id);
        Ok(())
    }
}

#[async_trait]
impl SearchSink for LocalStorage {
    async fn commit(&self, document: &SearchDocument) -> Result<()> {
        self.write_json(&Self::index_key(document.record_id, document.offset), document)
            .await
    }
}

#[async_trait]
impl SearchIndex for LocalStorage {
    async fn find_by_surt(&self, surt: &str, exact: bool) -> Result<Vec<SearchDocument>> {
        self.find_committed(|d| if exact { d.surt == surt } else { d.surt.starts_with(surt) })
            .await
    }

    async fn find_by_rule(&self, rule_id: u64) -> Result<Vec<SearchDocument>> {
        self.find_committed(|d| d.rule_id == Some(rule_id)).await
    }
}

#[async_trait]
impl RuleStore for LocalStorage {
    async fn load_rules(&self) -> Result<AccessControl> {
        let rules: Option<Vec<AccessRule>> = self.read_json(RULES_KEY).await?;
        AccessControl::new(rules.unwrap_or_default())
    }

    async fn save_rules(&self, rules: &AccessControl) -> Result<()> {
        self.write_json(RULES_KEY, rules.rules()).await
    }

    async fn load_run(&self) -> Result<Option<RuleRun>> {
        self.read_json(RULE_RUN_KEY).await
    }

    async fn save_run(&self, run: &RuleRun) -> Result<()> {
        self.write_json(RULE_RUN_KEY, run).await
    }

    async fn clear_run(&self) -> Result<()> {
        match tokio::fs::remove_file(self.path(RULE_RUN_KEY)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

/// Access rules published as a JSON file, re-read on every fetch.
#[derive(Debug, Clone)]
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleFeed for RuleFile {
    async fn fetch_rules(&self) -> Result<AccessControl> {
        let bytes = tokio::fs::read(&self.path).await?;
        AccessControl::from_json(&bytes)
    }
}

#[async_trait]
impl LockStore for LocalStorage {
    async fn try_insert(&self, lock: Lock, now: DateTime<Utc>) -> Result<bool> {
        self.update_locks(move |locks| {
            if locks.get(&lock.key).is_some_and(|l| l.is_live(now)) {
                return (false, false);
            }
            locks.insert(lock.key.clone(), lock);
            (true, true)
        })
        .await
    }

    async fn remove(&self, key: &str, holder: &str) -> Result<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.update_locks(move |locks| {
            if !locks.get(&key).is_some_and(|l| l.holder == holder) {
                return (false, false);
            }
            locks.remove(&key);
            (true, true)
        })
        .await
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.update_locks(move |locks| {
            let before = locks.len();
            locks.retain(|_, lock| lock.is_live(now));
            let removed = before - locks.len();
            (removed, removed > 0)
        })
        .await
    }

    async fn refresh(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<usize> {
        let holder = holder.to_string();
        self.update_locks(move |locks| {
            let mut refreshed = 0;
            for lock in locks.values_mut().filter(|l| l.holder == holder) {
                lock.checked_in = now;
                lock.expires_at = expires_at;
                refreshed += 1;
            }
            (refreshed, refreshed > 0)
        })
        .await
    }

    // Reads need no guard: locks.json is only ever replaced by rename
    async fn get(&self, key: &str) -> Result<Option<Lock>> {
        Ok(self.read_locks().await?.remove(key))
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        Ok(self.read_locks().await?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::lock::LockManager;
    use crate::models::Document;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        storage.write_bytes("test.txt", b"hello").await.unwrap();
        let data = storage.read_bytes("test.txt").await.unwrap();
        assert_eq!(data, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        let data = storage.read_bytes("nope.txt").await.unwrap();
        assert!(data.is_none());
        assert!(storage.fetch_batch(1).await.unwrap().is_none());
        assert!(storage.list_ids(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_round_trip_and_listing() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let captured = "2019-05-01T00:00:00Z".parse().unwrap();

        for id in [12, 3, 7] {
            let doc = Document::new(0, "http://example.com/", captured).with_text("hi");
            storage.save_record(&Record::new(id, vec![doc])).await.unwrap();
        }

        assert_eq!(storage.list_ids(0, 10).await.unwrap(), vec![3, 7, 12]);
        assert_eq!(storage.list_ids(4, 1).await.unwrap(), vec![7]);

        let record = storage.fetch_batch(7).await.unwrap().unwrap();
        assert_eq!(record.documents[0].text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_cursor_persistence() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        assert_eq!(storage.load_cursor("full_reindex").await.unwrap(), None);
        storage.save_cursor("full_reindex", 99).await.unwrap();

        let reopened = LocalStorage::new(tmp.path());
        assert_eq!(reopened.load_cursor("full_reindex").await.unwrap(), Some(99));
        let cursors = reopened.list_cursors().await.unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].name, "full_reindex");
    }

    #[tokio::test]
    async fn test_commit_writes_document() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let doc = SearchDocument::new(4, 120, "http://example.com/", Utc::now());

        storage.commit(&doc).await.unwrap();
        let loaded = storage.load_committed(4, 120).await.unwrap().unwrap();
        assert_eq!(loaded.id, "4/120");
    }

    #[tokio::test]
    async fn test_file_lock_table() {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(tmp.path()));
        let a = LockManager::new(storage.clone(), "a", Duration::from_secs(60));
        let b = LockManager::new(storage.clone(), "b", Duration::from_secs(60));

        assert!(a.try_acquire("warc-1").await.unwrap());
        assert!(!b.try_acquire("warc-1").await.unwrap());

        // The table survives a reopen
        let reopened = LocalStorage::new(tmp.path());
        let locks = reopened.list().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].holder, "a");

        assert!(a.release("warc-1").await.unwrap());
        assert!(b.try_acquire("warc-1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_table_is_exclusive_across_handles() {
        let tmp = TempDir::new().unwrap();
        // Two handles on one directory behave like two indexer processes
        let a = LockManager::new(Arc::new(LocalStorage::new(tmp.path())), "proc-a", Duration::from_secs(60));
        let b = LockManager::new(Arc::new(LocalStorage::new(tmp.path())), "proc-b", Duration::from_secs(60));

        for round in 0..50 {
            let key = format!("warc-{}", round);
            let (got_a, got_b) = tokio::join!(a.try_acquire(&key), b.try_acquire(&key));
            let (got_a, got_b) = (got_a.unwrap(), got_b.unwrap());
            assert!(got_a != got_b, "round {}: a={} b={}", round, got_a, got_b);
        }

        let locks = LocalStorage::new(tmp.path()).list().await.unwrap();
        assert_eq!(locks.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_file() {
        let tmp = TempDir::new().unwrap();
        let a = LocalStorage::new(tmp.path());
        let b = LocalStorage::new(tmp.path());

        for round in 0..20 {
            let (first, second) = tokio::join!(
                a.save_cursor("full_reindex", round),
                b.save_cursor("full_reindex", round + 100)
            );
            first.unwrap();
            second.unwrap();
        }

        let last = a.load_cursor("full_reindex").await.unwrap().unwrap();
        assert!(last == 19 || last == 119);
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("cursors"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_search_index_scans_committed_documents() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        assert!(storage.find_by_rule(1).await.unwrap().is_empty());

        let date = "2016-02-01T00:00:00Z".parse().unwrap();
        let mut gov = SearchDocument::new(10, 0, "http://www.nla.gov.au/", date);
        gov.surt = "(au,gov,nla,www,)/".into();
        gov.rule_id = Some(3);
        let mut com = SearchDocument::new(2, 50, "http://example.com/", date);
        com.surt = "(com,example,)/".into();
        storage.commit(&gov).await.unwrap();
        storage.commit(&com).await.unwrap();

        // A recommit replaces the stored version
        gov.rule_id = Some(4);
        storage.commit(&gov).await.unwrap();

        let all = storage.committed_documents().await.unwrap();
        assert_eq!(all.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["2/50", "10/0"]);

        assert_eq!(storage.find_by_surt("(au,", false).await.unwrap()[0].id, "10/0");
        assert_eq!(storage.find_by_surt("(com,example,)/", true).await.unwrap().len(), 1);
        assert!(storage.find_by_surt("(com,", true).await.unwrap().is_empty());
        assert!(storage.find_by_rule(3).await.unwrap().is_empty());
        assert_eq!(storage.find_by_rule(4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rule_store_files() {
        use crate::rules::DocumentStatus;

        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        assert!(storage.load_rules().await.unwrap().is_empty());
        storage.clear_run().await.unwrap();

        let rules = AccessControl::new(vec![
            AccessRule::new(2, "(au,gov,", DocumentStatus::RestrictedForDelivery),
            AccessRule::new(1, "(au,", DocumentStatus::RestrictedForBoth),
        ])
        .unwrap();
        storage.save_rules(&rules).await.unwrap();
        let reopened = LocalStorage::new(tmp.path());
        assert_eq!(reopened.load_rules().await.unwrap(), rules);

        let mut run = RuleRun::new(Utc::now());
        run.last_rule_id = Some(2);
        reopened.save_run(&run).await.unwrap();
        assert_eq!(storage.load_run().await.unwrap(), Some(run));
        storage.clear_run().await.unwrap();
        assert!(reopened.load_run().await.unwrap().is_none());

        let feed_path = tmp.path().join("published.json");
        std::fs::write(&feed_path, serde_json::to_vec(rules.rules()).unwrap()).unwrap();
        assert_eq!(RuleFile::new(&feed_path).fetch_rules().await.unwrap(), rules);
        assert!(RuleFile::new(tmp.path().join("missing.json")).fetch_rules().await.is_err());
    }
}
