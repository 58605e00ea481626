//! In-memory index of transaction contexts.

use std::collections::HashMap;
use std::sync::Arc;

use common::TransactionId;
use tokio::sync::{Mutex, RwLock};

use crate::context::TransactionContext;

/// Shared handle to one transaction's context.
pub type ContextHandle = Arc<Mutex<TransactionContext>>;

/// Concurrent map of transaction contexts keyed by transaction ID.
///
/// Each context sits behind its own mutex; holders mutate it only after
/// writing the same change to the log, which stays the source of truth.
#[derive(Default)]
pub struct TransactionRegistry {
    contexts: RwLock<HashMap<TransactionId, ContextHandle>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) a context and returns its handle.
    pub async fn insert(&self, context: TransactionContext) -> ContextHandle {
        let id = context.transaction_id();
        let handle = Arc::new(Mutex::new(context));
        self.contexts.write().await.insert(id, Arc::clone(&handle));
        handle
    }

    pub async fn get(&self, transaction_id: TransactionId) -> Option<ContextHandle> {
        self.contexts.read().await.get(&transaction_id).cloned()
    }

    /// Returns a copy of the current context.
    pub async fn snapshot(&self, transaction_id: TransactionId) -> Option<TransactionContext> {
        let handle = self.get(transaction_id).await?;
        let context = handle.lock().await.clone();
        Some(context)
    }

    /// Returns copies of every context.
    pub async fn snapshots(&self) -> Vec<TransactionContext> {
        let handles: Vec<ContextHandle> = self.contexts.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.clone());
        }
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}
