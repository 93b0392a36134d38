use std::{
    collections::{BTreeMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt, spawn, sync::mpsc, time::sleep};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::{
    call::{Call, CallId, CallUpdate},
    config::StoreConfig,
};

use super::{CallRecords, ChangeKind, FeedChange, FeedDocument, MessageFeed, Store};

const STALE_LOCK: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(10);

#[derive(Default, Deserialize, Serialize)]
struct Contents {
    #[serde(default)]
    calls: BTreeMap<CallId, Call>,
    #[serde(default)]
    feeds: BTreeMap<CallId, Vec<Value>>,
}

impl Contents {
    fn documents(&self, call_id: &str) -> Vec<FeedDocument> {
        self.feeds
            .get(call_id)
            .map(|feed| {
                feed.iter()
                    .enumerate()
                    .map(|(i, body)| FeedDocument {
                        seq: i as u64 + 1,
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Held lock. The file holds the owner's token so a taken-over lock is left alone on drop.
struct LockFile {
    path: PathBuf,
    token: String,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!("failed to remove lock file {}: {}", self.path.display(), err);
                }
            }
            Ok(_) => warn!("lock file {} was taken over", self.path.display()),
            Err(err) => warn!("failed to read lock file {}: {}", self.path.display(), err),
        }
    }
}

async fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

async fn is_stale(lock: &Path) -> bool {
    age(lock).await.is_some_and(|age| age > STALE_LOCK)
}

/// Moves the lock aside and deletes it only if what was moved is still stale. A fresh lock
/// moved by mistake is linked back, which never replaces a newer one.
async fn break_stale_lock(lock: &Path) -> bool {
    let aside = lock.with_extension(format!("lock.{}", Uuid::new_v4()));
    if fs::rename(lock, &aside).await.is_err() {
        return false;
    }
    let stale = age(&aside).await.is_some_and(|age| age > STALE_LOCK);
    if stale {
        warn!("removed stale lock file {}", lock.display());
    } else if let Err(err) = fs::hard_link(&aside, lock).await {
        warn!("failed to restore lock file {}: {}", lock.display(), err);
    }
    if let Err(err) = fs::remove_file(&aside).await {
        warn!("failed to remove {}: {}", aside.display(), err);
    }
    stale
}

async fn read_contents(path: &Path) -> Result<Contents> {
    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Contents::default()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    if json.trim().is_empty() {
        return Ok(Contents::default());
    }
    serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
}

/// Store kept in one JSON file, shared between processes on the same machine.
///
/// Writers serialize through a sibling `.lock` file and replace the store atomically.
/// Listeners poll the file.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.path.clone(), config.poll_interval())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn lock(&self) -> Result<LockFile> {
        let path = self.path.with_extension("lock");
        let token = Uuid::new_v4().to_string();
        loop {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(mut file) => {
                    let lock = LockFile { path, token };
                    file.write_all(lock.token.as_bytes())
                        .await
                        .with_context(|| format!("failed to write {}", lock.path.display()))?;
                    file.flush().await?;
                    return Ok(lock);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await && break_stale_lock(&path).await {
                        continue;
                    }
                    sleep(LOCK_RETRY).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", path.display()))
                }
            }
        }
    }

    async fn read(&self) -> Result<Contents> {
        read_contents(&self.path).await
    }

    async fn write(&self, contents: &Contents) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(contents)?)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    async fn modify<R>(&self, f: impl FnOnce(&mut Contents) -> R + Send) -> Result<R> {
        let _lock = self.lock().await?;
        let mut contents = self.read().await?;
        let result = f(&mut contents);
        self.write(&contents).await?;
        Ok(result)
    }
}

#[async_trait]
impl MessageFeed for FileStore {
    async fn append(&self, call_id: &str, body: Value) -> Result<u64> {
        let seq = self
            .modify(|contents| {
                let feed = contents.feeds.entry(call_id.to_owned()).or_default();
                feed.push(body);
                feed.len() as u64
            })
            .await?;
        trace!("appended #{} to feed {}", seq, call_id);
        Ok(seq)
    }

    async fn fetch(&self, call_id: &str) -> Result<Vec<FeedDocument>> {
        Ok(self.read().await?.documents(call_id))
    }

    async fn listen(
        &self,
        call_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Result<FeedChange>>> {
        let mut seen = self.read().await?.documents(call_id).len();
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let call_id = call_id.to_owned();
        spawn(async move {
            loop {
                sleep(poll_interval).await;
                if tx.is_closed() {
                    break;
                }
                let documents = match read_contents(&path).await {
                    Ok(contents) => contents.documents(&call_id),
                    Err(err) => {
                        if tx.send(Err(err)).is_err() {
                            break;
                        }
                        continue;
                    }
                };
                for document in documents.into_iter().skip(seen) {
                    seen += 1;
                    let change = FeedChange {
                        kind: ChangeKind::Added,
                        document,
                    };
                    if tx.send(Ok(change)).is_err() {
                        return;
                    }
                }
            }
            trace!("feed listener for {} released", call_id);
        });
        Ok(rx)
    }
}

#[async_trait]
impl CallRecords for FileStore {
    async fn create_call(&self, call: Call) -> Result<CallId> {
        let id = if call.id().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            call.id().clone()
        };
        let call = call.with_id(id.clone());
        self.modify(|contents| {
            contents.calls.insert(id.clone(), call);
        })
        .await?;
        Ok(id)
    }

    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<bool> {
        self.modify(|contents| {
            let Some(call) = contents.calls.get_mut(call_id) else {
                return false;
            };
            call.apply(&update);
            true
        })
        .await
    }

    async fn delete_call(&self, call_id: &str) -> Result<bool> {
        self.modify(|contents| contents.calls.remove(call_id).is_some())
            .await
    }

    async fn find_call(&self, call_id: &str) -> Result<Option<Call>> {
        Ok(self.read().await?.calls.remove(call_id))
    }

    async fn incoming_calls_for(&self, user_id: &str) -> Result<mpsc::UnboundedReceiver<Call>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        let user_id = user_id.to_owned();
        spawn(async move {
            let mut reported = HashSet::new();
            loop {
                match read_contents(&path).await {
                    Ok(contents) => {
                        let mut pending: Vec<_> = contents
                            .calls
                            .into_values()
                            .filter(|call| {
                                call.status().is_pending()
                                    && call.callee_id() == &user_id
                                    && !reported.contains(call.id())
                            })
                            .collect();
                        pending.sort_by_key(|call| call.timestamp());
                        for call in pending {
                            reported.insert(call.id().clone());
                            if tx.send(call).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => warn!("failed to poll incoming calls: {:#}", err),
                }
                sleep(poll_interval).await;
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

impl Store for FileStore {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::call::{CallStatus, Participant};

    use super::*;

    fn store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path().join("store.json"), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.fetch("c1").await.unwrap().is_empty());
        assert!(store.find_call("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let call = Call::new(
            &Participant::new("alice".into(), "Alice".into()),
            &Participant::new("bob".into(), "Bob".into()),
        );
        let id = store(&dir).create_call(call).await.unwrap();
        assert!(store(&dir)
            .update_call(&id, CallUpdate::status(CallStatus::Accepted))
            .await
            .unwrap());

        let found = store(&dir).find_call(&id).await.unwrap().unwrap();
        assert_eq!(found.status(), CallStatus::Accepted);
        assert_eq!(found.caller_name(), "Alice");
        assert!(!dir.path().join("store.lock").exists());
    }

    #[tokio::test]
    async fn listener_polls_new_documents_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.append("c1", json!({"n": 1})).await.unwrap();
        let mut changes = store.listen("c1").await.unwrap();
        store.append("c1", json!({"n": 2})).await.unwrap();

        let change = changes.recv().await.unwrap().unwrap();
        assert_eq!(change.document.seq, 2);
        assert_eq!(change.document.body, json!({"n": 2}));
    }

    fn write_lock(dir: &tempfile::TempDir, owner: &str, age: Duration) -> PathBuf {
        let lock = dir.path().join("store.lock");
        std::fs::write(&lock, owner).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        lock
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = write_lock(&dir, "crashed", Duration::from_secs(60));
        store(&dir).append("c1", json!({"n": 1})).await.unwrap();
        assert!(!lock.exists());
        assert_eq!(store(&dir).fetch("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fresh_lock_survives_a_late_takeover() {
        let dir = tempfile::tempdir().unwrap();
        // A waiter that judged an older lock stale finds a new owner in its place.
        let lock = write_lock(&dir, "owner", Duration::ZERO);
        assert!(!break_stale_lock(&lock).await);
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "owner");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let append = spawn({
            let store = store(&dir);
            async move { store.append("c1", json!({"n": 1})).await.unwrap() }
        });
        sleep(Duration::from_millis(100)).await;
        assert!(!append.is_finished());
        std::fs::remove_file(&lock).unwrap();
        assert_eq!(append.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                spawn(async move { store.append("c1", json!({ "n": n })).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.fetch("c1").await.unwrap().len(), 8);
    }
}
