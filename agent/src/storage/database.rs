//! Transactional key-value store
//!
//! The store is small (a handful of keys holding JSON blobs), so both
//! backends keep the whole map in memory and persist it as one document.
//! A transaction reads a snapshot, stages writes and removals, and is applied
//! in one step on commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::errors::AgentError;
use crate::filesys::file::File;

/// Staged changes on top of a snapshot of the store
#[derive(Debug, Default)]
pub struct Transaction {
    snapshot: BTreeMap<String, Vec<u8>>,
    changes: BTreeMap<String, Option<Vec<u8>>>,
}

impl Transaction {
    fn new(snapshot: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            snapshot,
            changes: BTreeMap::new(),
        }
    }

    /// Read a key, seeing writes staged earlier in this transaction
    pub fn read(&self, key: &str) -> Result<Vec<u8>, AgentError> {
        let value = match self.changes.get(key) {
            Some(staged) => staged.as_ref(),
            None => self.snapshot.get(key),
        };
        value
            .cloned()
            .ok_or_else(|| AgentError::KeyNotFound(key.to_string()))
    }

    /// Read a key, mapping absence to `None`
    pub fn read_optional(&self, key: &str) -> Result<Option<Vec<u8>>, AgentError> {
        match self.read(key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_key_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write(&mut self, key: &str, value: &[u8]) {
        self.changes.insert(key.to_string(), Some(value.to_vec()));
    }

    /// Remove a key. Removing an absent key is not an error.
    pub fn remove(&mut self, key: &str) {
        self.changes.insert(key.to_string(), None);
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn into_changes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.changes
    }
}

/// Storage engine behind the agent's persisted keys
#[async_trait]
pub trait KeyValueDatabase: Send + Sync {
    /// Current contents of the store
    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>, AgentError>;

    /// Apply staged changes atomically: either all of them persist or none
    async fn apply(&self, changes: BTreeMap<String, Option<Vec<u8>>>) -> Result<(), AgentError>;

    /// Start a transaction
    async fn begin(&self) -> Result<Transaction, AgentError> {
        Ok(Transaction::new(self.snapshot().await?))
    }

    /// Commit a transaction started with [`KeyValueDatabase::begin`]
    async fn commit(&self, txn: Transaction) -> Result<(), AgentError> {
        if txn.is_empty() {
            return Ok(());
        }
        self.apply(txn.into_changes()).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, AgentError> {
        self.begin().await?.read(key)
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), AgentError> {
        let mut txn = self.begin().await?;
        txn.write(key, value);
        self.commit(txn).await
    }

    async fn remove(&self, key: &str) -> Result<(), AgentError> {
        let mut txn = self.begin().await?;
        txn.remove(key);
        self.commit(txn).await
    }
}

/// Run `f` inside a transaction and commit it if `f` succeeds
pub async fn write_transaction<T, F>(db: &dyn KeyValueDatabase, f: F) -> Result<T, AgentError>
where
    F: FnOnce(&mut Transaction) -> Result<T, AgentError>,
{
    let mut txn = db.begin().await?;
    let result = f(&mut txn)?;
    db.commit(txn).await?;
    Ok(result)
}

fn merge(data: &mut BTreeMap<String, Vec<u8>>, changes: BTreeMap<String, Option<Vec<u8>>>) {
    for (key, change) in changes {
        match change {
            Some(value) => {
                data.insert(key, value);
            }
            None => {
                data.remove(&key);
            }
        }
    }
}

// =============================== FILE BACKEND ================================== //

/// Store persisted as a single JSON document, replaced atomically on commit
pub struct FileDatabase {
    file: File,
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileDatabase {
    /// Open the store, creating an empty one if the file does not exist
    pub async fn open(file: File) -> Result<Self, AgentError> {
        let data = if file.exists().await {
            let encoded: BTreeMap<String, String> = file.read_json().await.map_err(|e| {
                AgentError::DatabaseError(format!(
                    "Unable to read datastore {}: {}",
                    file.path().display(),
                    e
                ))
            })?;
            encoded
                .into_iter()
                .map(|(key, value)| {
                    BASE64
                        .decode(value.as_bytes())
                        .map(|bytes| (key.clone(), bytes))
                        .map_err(|e| {
                            AgentError::DatabaseValueError(format!("Key {}: {}", key, e))
                        })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?
        } else {
            BTreeMap::new()
        };

        debug!(
            "Opened datastore {} with {} keys",
            file.path().display(),
            data.len()
        );
        Ok(Self {
            file,
            data: Mutex::new(data),
        })
    }
}

#[async_trait]
impl KeyValueDatabase for FileDatabase {
    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>, AgentError> {
        Ok(self.data.lock().await.clone())
    }

    async fn apply(&self, changes: BTreeMap<String, Option<Vec<u8>>>) -> Result<(), AgentError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        merge(&mut next, changes);

        let encoded: BTreeMap<&String, String> =
            next.iter().map(|(k, v)| (k, BASE64.encode(v))).collect();
        let contents = serde_json::to_vec(&encoded)?;
        self.file
            .write_atomic(&contents)
            .await
            .map_err(|e| AgentError::DatabaseError(format!("Commit failed: {}", e)))?;

        trace!("Datastore committed ({} keys)", next.len());
        *data = next;
        Ok(())
    }
}

// ============================== MEMORY BACKEND ================================= //

/// Volatile store, with injectable commit failures for tests
#[derive(Default)]
pub struct MemoryDatabase {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_commits: AtomicU32,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail without changing anything
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueDatabase for MemoryDatabase {
    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>, AgentError> {
        Ok(self.data.lock().await.clone())
    }

    async fn apply(&self, changes: BTreeMap<String, Option<Vec<u8>>>) -> Result<(), AgentError> {
        let should_fail = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AgentError::DatabaseError(
                "Injected commit failure".to_string(),
            ));
        }

        merge(&mut *self.data.lock().await, changes);
        Ok(())
    }
}
