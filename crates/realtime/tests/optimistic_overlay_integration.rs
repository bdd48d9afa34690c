use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pagesync_common::protocol::realtime::RowEventType;
use pagesync_common::types::{PagePatch, PageRecord, Record, RecordId, PAGES_TABLE};
use pagesync_realtime::config::OptimisticConfig;
use pagesync_realtime::optimistic::MutationNotice;
use pagesync_realtime::scheduler::Scheduler;
use pagesync_realtime::{
    ChangeFilter, ChangeHandlers, ChannelKey, ChannelMultiplexer, ChannelSpec, Entity, ManualScheduler,
    MemoryBackend, MutationError, OptimisticStore, RealtimeConfig, RemoteError, RowChange, Unsubscribe,
};
use uuid::Uuid;

/// One client: a change channel, the confirmed list it feeds, and a store following it.
struct Client {
    scheduler: Arc<ManualScheduler>,
    backend: Arc<MemoryBackend>,
    store: OptimisticStore<PageRecord>,
    confirmed: Arc<Mutex<BTreeMap<RecordId, PageRecord>>>,
    workspace: Uuid,
    _subs: Vec<Unsubscribe>,
    // Owns the channels; dropping it closes them.
    _mux: ChannelMultiplexer,
}

impl Client {
    fn new(config: OptimisticConfig) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        let backend = Arc::new(MemoryBackend::new(scheduler.clone()));
        let mux = ChannelMultiplexer::new(backend.clone(), scheduler.clone(), &RealtimeConfig::default());
        let workspace = Uuid::new_v4();
        let spec = ChannelSpec::topic("workspace:W").with_table(PAGES_TABLE).filter_eq("workspace_id", workspace);
        let key = ChannelKey::for_spec(&spec);
        let store = OptimisticStore::new("pages", scheduler.clone(), config);

        let confirmed = Arc::new(Mutex::new(BTreeMap::new()));
        let feed = Arc::clone(&confirmed);
        let changes = mux.subscribe_to_changes(
            &key,
            &spec,
            ChangeFilter::all(),
            ChangeHandlers::on_any(move |change: &RowChange| {
                let mut rows = feed.lock().expect("confirmed lock");
                match change.event_type {
                    RowEventType::Delete => {
                        if let Some(id) = change.record_id() {
                            rows.remove(id);
                        }
                    }
                    _ => {
                        if let Some(page) = change.new.clone().and_then(PageRecord::from_record) {
                            rows.insert(page.id.clone(), page);
                        }
                    }
                }
            }),
        );
        let follow = store.follow(&mux, &key, &spec);

        Self { scheduler, backend, store, confirmed, workspace, _subs: vec![changes, follow], _mux: mux }
    }

    fn confirmed(&self) -> Vec<PageRecord> {
        self.confirmed.lock().expect("confirmed lock").values().cloned().collect()
    }

    fn view(&self) -> Vec<PageRecord> {
        self.store.merged_view(&self.confirmed())
    }

    fn titles(&self) -> Vec<String> {
        self.view().into_iter().map(|page| page.title).collect()
    }

    fn draft(&self, parent: &str, title: &str) -> PageRecord {
        PageRecord::draft(self.workspace, Some(RecordId::from(parent)), title)
    }

    /// Another writer persists a record with the same fields as `draft`.
    fn confirm_elsewhere(&self, draft: &PageRecord) -> RecordId {
        let mut page = draft.clone();
        page.id = RecordId::generate();
        page.client_ref = None;
        page.created_at = self.scheduler.now();
        page.updated_at = page.created_at;
        self.backend.put_record(Record::Page(page.clone())).expect("put");
        page.id
    }

    fn seed(&self, title: &str) -> PageRecord {
        let mut page = self.draft("P", title);
        page.id = RecordId::generate();
        self.backend.put_record(Record::Page(page.clone())).expect("seed");
        page
    }
}

#[test]
fn matching_confirmed_record_replaces_pending_create_exactly_once() {
    let client = Client::new(OptimisticConfig::default());
    let draft = client.draft("P", "Report");
    let temp_id = client.store.optimistic_create(draft.clone()).expect("valid draft");
    assert!(temp_id.is_temporary());
    assert_eq!(client.titles(), vec!["Report"]);

    client.scheduler.advance(Duration::from_secs(4));
    let real_id = client.confirm_elsewhere(&draft);

    let view = client.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, real_id);
    assert!(client.store.is_empty());

    // A repeated echo of the same row changes nothing.
    let mut page = client.confirmed()[0].clone();
    page.icon = Some("📄".into());
    client.backend.put_record(Record::Page(page)).expect("update");
    assert_eq!(client.view().len(), 1);
}

#[test]
fn confirmed_record_outside_window_does_not_absorb_pending_create() {
    let client = Client::new(OptimisticConfig::default());
    let draft = client.draft("P", "Report");
    client.store.optimistic_create(draft.clone()).expect("valid draft");

    client.scheduler.advance(Duration::from_secs(6));
    client.confirm_elsewhere(&draft);
    assert_eq!(client.titles(), vec!["Report", "Report"]);

    // The pending create still expires on its own.
    client.scheduler.advance(Duration::from_secs(5));
    assert_eq!(client.titles(), vec!["Report"]);
}

#[test]
fn disabling_the_heuristic_keeps_same_titled_creates_apart() {
    let config = OptimisticConfig { heuristic_matching: false, ..OptimisticConfig::default() };
    let client = Client::new(config);
    let draft = client.draft("P", "Notes");
    client.store.optimistic_create(draft.clone()).expect("valid draft");
    client.confirm_elsewhere(&draft);
    assert_eq!(client.titles(), vec!["Notes", "Notes"]);
    assert_eq!(client.store.summary().creates, 1);
}

#[tokio::test]
async fn create_through_backend_reconciles_by_client_ref() {
    let config = OptimisticConfig { heuristic_matching: false, ..OptimisticConfig::default() };
    let client = Client::new(config);
    let mut notices = client.store.notices();

    let confirmed = client
        .store
        .create(client.backend.as_ref(), client.draft("P", "Report"))
        .await
        .expect("create should succeed");
    assert!(confirmed.client_ref.as_deref().is_some_and(|r| r.starts_with(RecordId::TEMP_PREFIX)));
    assert_eq!(client.view(), vec![confirmed.clone()]);
    assert!(client.store.is_empty());
    assert!(matches!(notices.recv().await, Ok(MutationNotice::Confirmed { .. })));
}

#[test]
fn unconfirmed_update_expires_after_its_ttl() {
    let client = Client::new(OptimisticConfig::default());
    let page = client.seed("Original");
    let before = client.view();

    client.store.optimistic_update(&page.id, PagePatch::title("Edited")).expect("valid patch");
    assert_eq!(client.titles(), vec!["Edited"]);

    client.scheduler.advance(Duration::from_millis(29_999));
    assert_eq!(client.titles(), vec!["Edited"]);
    client.scheduler.advance(Duration::from_millis(2));
    assert!(client.store.pending_update(&page.id).is_none());
    assert_eq!(client.view(), before);
}

#[tokio::test]
async fn rejected_update_restores_the_pre_update_view() {
    let client = Client::new(OptimisticConfig::default());
    let page = client.seed("Original");
    let before = client.view();
    let mut notices = client.store.notices();

    client.backend.fail_next_remote(RemoteError::Permission("read-only workspace".into()));
    let result = client.store.update(client.backend.as_ref(), &page.id, PagePatch::title("Edited")).await;

    assert!(matches!(result, Err(MutationError::Remote(RemoteError::Permission(_)))));
    assert_eq!(client.view(), before);
    assert!(client.store.is_empty());
    assert!(matches!(
        notices.recv().await,
        Ok(MutationNotice::Failed { error: RemoteError::Permission(_), .. })
    ));
}

#[tokio::test]
async fn confirmed_delete_clears_tombstone_through_the_feed() {
    let client = Client::new(OptimisticConfig::default());
    let keep = client.seed("Keep");
    let gone = client.seed("Gone");

    client.store.delete(client.backend.as_ref(), &gone.id).await.expect("delete should succeed");
    assert_eq!(client.view(), vec![keep]);
    assert!(!client.store.is_tombstoned(&gone.id));
    assert!(client.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn local_validation_never_reaches_the_backend() {
    let client = Client::new(OptimisticConfig::default());
    client.backend.fail_next_remote(RemoteError::Timeout);

    let result = client.store.create(client.backend.as_ref(), client.draft("P", "   ")).await;
    assert!(matches!(result, Err(MutationError::Validation(_))));
    assert!(client.store.is_empty());

    // The queued failure is still there: no call was made.
    let draft = client.draft("P", "Real");
    let create = client.store.create(client.backend.as_ref(), draft);
    tokio::pin!(create);
    let result = loop {
        tokio::select! {
            biased;
            result = &mut create => break result,
            () = tokio::task::yield_now() => {
                client.scheduler.advance(Duration::from_millis(50));
            }
        }
    };
    assert!(result.is_ok(), "timeout is retried, then the create succeeds");
}
