//! Idempotency keys and the store that remembers applied operations.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{ParticipantId, Phase, Result, TransactionId};

/// Identifies one phase of one participant within one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub transaction_id: TransactionId,
    pub participant_id: ParticipantId,
    pub phase: Phase,
}

impl IdempotencyKey {
    pub fn new(transaction_id: TransactionId, participant_id: ParticipantId, phase: Phase) -> Self {
        Self {
            transaction_id,
            participant_id,
            phase,
        }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.transaction_id, self.participant_id, self.phase
        )
    }
}

/// Records which phase operations have already been applied.
///
/// Participants check a key before mutating shared resources and mark it
/// once the mutation has succeeded, making repeated phase calls no-ops.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if the key has been marked.
    async fn check(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Marks the key. Returns true if it was not marked before.
    async fn mark(&self, key: &IdempotencyKey) -> Result<bool>;
}

#[async_trait]
impl<T: IdempotencyStore + ?Sized> IdempotencyStore for Arc<T> {
    async fn check(&self, key: &IdempotencyKey) -> Result<bool> {
        (**self).check(key).await
    }

    async fn mark(&self, key: &IdempotencyKey) -> Result<bool> {
        (**self).mark(key).await
    }
}

/// In-memory idempotency store for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    keys: Arc<RwLock<HashSet<IdempotencyKey>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of marked keys.
    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.keys.read().await.contains(key))
    }

    async fn mark(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.keys.write().await.insert(key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(phase: Phase) -> IdempotencyKey {
        IdempotencyKey::new(TransactionId::new(), ParticipantId::from("account"), phase)
    }

    #[test]
    fn key_display() {
        let tx = TransactionId::new();
        let key = IdempotencyKey::new(tx, ParticipantId::from("order"), Phase::Cancel);
        assert_eq!(key.to_string(), format!("{tx}:order:CANCEL"));
    }

    #[tokio::test]
    async fn mark_then_check() {
        let store = InMemoryIdempotencyStore::new();
        let key = key(Phase::Confirm);

        assert!(!store.check(&key).await.unwrap());
        assert!(store.mark(&key).await.unwrap());
        assert!(store.check(&key).await.unwrap());
        assert!(!store.mark(&key).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn phases_are_distinct_keys() {
        let store = InMemoryIdempotencyStore::new();
        let confirm = key(Phase::Confirm);
        let cancel = IdempotencyKey {
            phase: Phase::Cancel,
            ..confirm.clone()
        };

        store.mark(&confirm).await.unwrap();
        assert!(!store.check(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn shared_through_arc() {
        let store: Arc<dyn IdempotencyStore> = Arc::new(InMemoryIdempotencyStore::new());
        let key = key(Phase::Try);
        store.mark(&key).await.unwrap();
        assert!(store.check(&key).await.unwrap());
    }
}
