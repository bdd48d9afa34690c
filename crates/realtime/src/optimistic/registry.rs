// Scope-wide set of optimistic stores, one per (table, collection).

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::OptimisticConfig;
use crate::lock;
use crate::scheduler::Scheduler;

use super::entity::Entity;
use super::store::{OptimisticStore, OverlaySummary};

/// Type-erased view of a store so the registry can hold every entity kind.
trait Overlay: Send + Sync {
    fn revert(&self) -> usize;
    fn summary(&self) -> OverlaySummary;
    fn as_any(&self) -> &dyn Any;
}

impl<E: Entity> Overlay for OptimisticStore<E> {
    fn revert(&self) -> usize {
        self.revert_all_optimistic_changes()
    }

    fn summary(&self) -> OverlaySummary {
        OptimisticStore::summary(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type StoreKey = (&'static str, String);

/// Hands out the store for a collection, creating it on first use.
pub struct OptimisticRegistry {
    scheduler: Arc<dyn Scheduler>,
    config: OptimisticConfig,
    stores: Mutex<BTreeMap<StoreKey, Arc<dyn Overlay>>>,
}

impl OptimisticRegistry {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: OptimisticConfig) -> Self {
        Self { scheduler, config, stores: Mutex::new(BTreeMap::new()) }
    }

    pub fn store<E: Entity>(&self, collection: &str) -> OptimisticStore<E> {
        let key = (E::TABLE, collection.to_string());
        let mut stores = lock(&self.stores);
        if let Some(store) =
            stores.get(&key).and_then(|overlay| overlay.as_any().downcast_ref::<OptimisticStore<E>>())
        {
            return store.clone();
        }
        debug!(table = E::TABLE, collection, "creating optimistic store");
        let store = OptimisticStore::<E>::new(
            format!("{}:{collection}", E::TABLE),
            Arc::clone(&self.scheduler),
            self.config.clone(),
        );
        stores.insert(key, Arc::new(store.clone()));
        store
    }

    /// Forget a collection after reverting whatever it still had pending.
    pub fn remove<E: Entity>(&self, collection: &str) -> bool {
        let removed = lock(&self.stores).remove(&(E::TABLE, collection.to_string()));
        removed.map(|overlay| overlay.revert()).is_some()
    }

    /// Revert every store. Returns how many entries were dropped in total.
    pub fn revert_all(&self) -> usize {
        let stores: Vec<Arc<dyn Overlay>> = lock(&self.stores).values().cloned().collect();
        stores.iter().map(|overlay| overlay.revert()).sum()
    }

    pub fn summary(&self) -> OverlaySummary {
        let stores: Vec<Arc<dyn Overlay>> = lock(&self.stores).values().cloned().collect();
        stores.iter().map(|overlay| overlay.summary()).fold(OverlaySummary::default(), |acc, s| {
            OverlaySummary {
                creates: acc.creates + s.creates,
                updates: acc.updates + s.updates,
                deletes: acc.deletes + s.deletes,
            }
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.stores).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use pagesync_common::types::{BlockRecord, PagePatch, PageRecord, RecordId};
    use uuid::Uuid;

    fn registry() -> OptimisticRegistry {
        OptimisticRegistry::new(Arc::new(ManualScheduler::new()), OptimisticConfig::default())
    }

    #[test]
    fn same_collection_shares_one_overlay() {
        let registry = registry();
        let a = registry.store::<PageRecord>("W");
        let b = registry.store::<PageRecord>("W");
        a.optimistic_delete(&RecordId::from("p-1"));
        assert!(b.is_tombstoned(&RecordId::from("p-1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn tables_are_kept_apart() {
        let registry = registry();
        registry.store::<PageRecord>("W").optimistic_delete(&RecordId::from("x"));
        assert!(registry.store::<BlockRecord>("W").is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn revert_all_spans_every_store() {
        let registry = registry();
        let pages = registry.store::<PageRecord>("W");
        pages.optimistic_create(PageRecord::draft(Uuid::nil(), None, "A")).expect("valid draft");
        pages.optimistic_update(&RecordId::from("p-1"), PagePatch::title("B")).expect("valid patch");
        registry.store::<BlockRecord>("W").optimistic_delete(&RecordId::from("b-1"));

        assert_eq!(registry.summary().total(), 3);
        assert_eq!(registry.revert_all(), 3);
        assert_eq!(registry.summary(), OverlaySummary::default());
    }

    #[test]
    fn remove_reverts_and_forgets() {
        let registry = registry();
        let pages = registry.store::<PageRecord>("W");
        pages.optimistic_delete(&RecordId::from("p-1"));
        assert!(registry.remove::<PageRecord>("W"));
        assert!(pages.is_empty());
        assert!(!registry.remove::<PageRecord>("W"));
    }
}
