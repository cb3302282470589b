//! Durable Client Storage Abstraction
//!
//! Session material, the authenticated flag, the user id, and the post-login
//! return path all live in a host-provided key/value store that survives
//! restarts. Multi-key updates go through [`WriteBatch`] so a crash can never
//! leave half a session behind.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{BridgeError, Result};

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: String, value: String },
    Remove { key: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Remove { key } => key,
        }
    }
}

/// Ordered set of mutations applied all-or-nothing by [`DurableStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Remove { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Durable key/value storage trait
///
/// Abstracts the host's persistent client storage:
/// - Desktop: SQLite table (see `bridge-desktop`)
/// - Browser shells: localStorage
/// - Tests: [`MemoryStore`]
///
/// # Atomicity
///
/// `commit` MUST apply every op in the batch or none of them. Readers never
/// observe a partially applied batch.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::{DurableStore, WriteBatch};
///
/// async fn mark_signed_in(store: &dyn DurableStore, user_id: &str) -> Result<()> {
///     store
///         .commit(
///             WriteBatch::new()
///                 .set("auth.authenticated", "true")
///                 .set("auth.user_id", user_id),
///         )
///         .await
/// }
/// ```
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key is absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Write a single value.
    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.commit(WriteBatch::new().set(key, value)).await
    }

    /// Delete a single value. Removing an absent key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()> {
        self.commit(WriteBatch::new().remove(key)).await
    }

    /// List every stored key.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Apply a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// In-process [`DurableStore`] backed by a `BTreeMap`.
///
/// Writes can be switched off with [`MemoryStore::fail_writes`] to exercise
/// storage failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `commit` fail without touching the contents.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the current contents.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::Storage("write rejected".to_string()));
        }

        let mut items = self.lock();
        for op in batch {
            match op {
                WriteOp::Set { key, value } => {
                    items.insert(key, value);
                }
                WriteOp::Remove { key } => {
                    items.remove(&key);
                }
            }
        }
        Ok(())
    }
}
