//! Resource Store Adapters
//!
//! `KubeStore` talks to the cluster API; `MemoryStore` keeps records in
//! process with the same optimistic-lock semantics.

pub mod cluster;
pub mod memory;

pub use cluster::KubeStore;
pub use memory::{MemoryStore, WriteCounts, WriteOp};

use std::future::Future;

use crate::error::Result;

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    Written(T),
    /// Lost the optimistic lock; the caller should requeue
    Conflict,
}

impl<T> WriteOutcome<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteOutcome::Conflict)
    }
}

/// Run a conditional write, turning a conflict into [`WriteOutcome::Conflict`]
pub async fn conditional<T, F>(write: F) -> Result<WriteOutcome<T>>
where
    F: Future<Output = Result<T>>,
{
    match write.await {
        Ok(value) => Ok(WriteOutcome::Written(value)),
        Err(e) if e.is_conflict() => Ok(WriteOutcome::Conflict),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_conditional_maps_conflicts() {
        let outcome = conditional(async {
            Err::<(), _>(Error::Conflict {
                kind: "GPUDevice".into(),
                name: "dev".into(),
            })
        })
        .await
        .unwrap();
        assert!(outcome.is_conflict());

        let outcome = conditional(async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written(7));

        let err = conditional(async { Err::<(), _>(Error::Internal("boom".into())) }).await;
        assert!(err.is_err());
    }
}
