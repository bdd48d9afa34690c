// Remote mutations wrapped in optimistic staging.
//
//   stage → remote call (transient errors retried) → clear on success
//                                                  → rollback + notice on failure
//
// A failed create drops only its own entry. A failed update or delete
// reverts the whole overlay, since a partial revert of layered patches
// cannot be reconstructed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use pagesync_common::types::RecordId;

use crate::error::{MutationError, RemoteError};
use crate::scheduler;

use super::entity::Entity;
use super::store::{MutationKind, MutationNotice, OptimisticStore};

/// The persistence service's write side.
#[async_trait]
pub trait RemoteStore<E: Entity>: Send + Sync {
    /// Persist a new record; the returned record carries the real id.
    async fn create(&self, record: E) -> Result<E, RemoteError>;

    async fn update(&self, id: &RecordId, patch: &E::Patch) -> Result<E, RemoteError>;

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError>;
}

impl<E: Entity> OptimisticStore<E> {
    /// Stage `draft`, persist it, and return the confirmed record.
    ///
    /// The pending create is cleared either way; callers fold the returned
    /// record into their confirmed list.
    pub async fn create(&self, remote: &dyn RemoteStore<E>, draft: E) -> Result<E, MutationError> {
        let (temp_id, staged) = self.stage_create(draft)?;

        let result = self
            .with_retries(MutationKind::Create, &temp_id, || remote.create(staged.clone()))
            .await;
        self.clear_optimistic_creation(&temp_id);
        match result {
            Ok(confirmed) => {
                info!(
                    collection = %self.collection(),
                    temp_id = %temp_id,
                    id = %confirmed.id(),
                    "create confirmed"
                );
                self.notify(MutationNotice::Confirmed {
                    collection: self.collection().to_string(),
                    kind: MutationKind::Create,
                    id: confirmed.id().clone(),
                });
                Ok(confirmed)
            }
            Err(error) => Err(self.fail(MutationKind::Create, &temp_id, error)),
        }
    }

    pub async fn update(
        &self,
        remote: &dyn RemoteStore<E>,
        id: &RecordId,
        patch: E::Patch,
    ) -> Result<E, MutationError> {
        let seq = self.stage_update(id, patch.clone())?;

        match self.with_retries(MutationKind::Update, id, || remote.update(id, &patch)).await {
            Ok(confirmed) => {
                // A newer patch staged meanwhile keeps its entry until its own call settles.
                self.clear_if_current(MutationKind::Update, id, seq);
                self.notify(MutationNotice::Confirmed {
                    collection: self.collection().to_string(),
                    kind: MutationKind::Update,
                    id: id.clone(),
                });
                Ok(confirmed)
            }
            Err(error) => {
                self.revert_all_optimistic_changes();
                Err(self.fail(MutationKind::Update, id, error))
            }
        }
    }

    pub async fn delete(&self, remote: &dyn RemoteStore<E>, id: &RecordId) -> Result<(), MutationError> {
        self.stage_delete(id);

        match self.with_retries(MutationKind::Delete, id, || remote.delete(id)).await {
            Ok(()) => {
                // The tombstone stays until the change feed confirms the delete
                // or it expires; the confirmed list may still hold the row.
                self.notify(MutationNotice::Confirmed {
                    collection: self.collection().to_string(),
                    kind: MutationKind::Delete,
                    id: id.clone(),
                });
                Ok(())
            }
            Err(error) => {
                self.revert_all_optimistic_changes();
                Err(self.fail(MutationKind::Delete, id, error))
            }
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        kind: MutationKind,
        id: &RecordId,
        mut call: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let retries = self.config().remote_retries;
        let delay = Duration::from_millis(self.config().remote_retry_delay_ms);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        collection = %self.collection(),
                        %kind,
                        id = %id,
                        %error,
                        attempt,
                        "transient remote failure; retrying"
                    );
                    scheduler::sleep(self.scheduler(), delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn fail(&self, kind: MutationKind, id: &RecordId, error: RemoteError) -> MutationError {
        warn!(
            collection = %self.collection(),
            %kind,
            id = %id,
            code = error.code(),
            %error,
            "remote mutation failed; optimistic change rolled back"
        );
        self.notify(MutationNotice::Failed {
            collection: self.collection().to_string(),
            kind,
            id: id.clone(),
            error: error.clone(),
        });
        MutationError::Remote(error)
    }
}
