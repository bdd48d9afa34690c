// `pages`: every client creates pages at once and waits for the feed to agree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use pagesync_common::presence::{PresenceMeta, PresencePeer};
use pagesync_common::protocol::realtime::RowEventType;
use pagesync_common::types::{PageRecord, RecordId, PAGES_TABLE};
use pagesync_realtime::scheduler::Scheduler;
use pagesync_realtime::{
    ChangeFilter, ChangeHandlers, ChannelKey, ChannelMultiplexer, ChannelSpec, Entity, MemoryBackend,
    OptimisticStore, PresenceHandlers, RealtimeConfig, RemoteError, RowChange, TokioScheduler,
    Unsubscribe,
};

use crate::output::{print_report, OutputFormat};

#[derive(Args, Debug)]
pub struct PagesArgs {
    #[arg(long, default_value_t = 3)]
    pub clients: usize,
    /// Pages each client creates
    #[arg(long, default_value_t = 5)]
    pub pages: usize,
    /// Latency of every remote call
    #[arg(long, default_value_t = 20)]
    pub latency_ms: u64,
    /// Creates the backend rejects outright (each one rolls back)
    #[arg(long, default_value_t = 0)]
    pub failures: usize,
    /// Backend drops client references, so matching relies on the heuristic
    #[arg(long)]
    pub no_client_ref: bool,
}

#[derive(Debug, Serialize)]
struct ClientReport {
    name: String,
    visible: usize,
    pending: usize,
    peers: usize,
}

#[derive(Debug, Serialize)]
struct PagesReport {
    clients: usize,
    attempted: usize,
    confirmed: usize,
    rolled_back: usize,
    backend_rows: usize,
    /// Largest view any client showed while creates were in flight.
    in_flight_view: usize,
    converged: bool,
    elapsed_ms: u128,
    per_client: Vec<ClientReport>,
}

type Confirmed = Arc<Mutex<BTreeMap<RecordId, PageRecord>>>;

struct Client {
    name: String,
    mux: ChannelMultiplexer,
    store: OptimisticStore<PageRecord>,
    confirmed: Confirmed,
    peers: Arc<AtomicUsize>,
    _subscriptions: Vec<Unsubscribe>,
}

impl Client {
    fn connect(
        index: usize,
        backend: &MemoryBackend,
        scheduler: &Arc<dyn Scheduler>,
        config: &RealtimeConfig,
        spec: &ChannelSpec,
    ) -> anyhow::Result<Self> {
        let name = format!("client-{index}");
        let spec = spec.clone().with_presence_key(&name);
        let key = ChannelKey::for_spec(&spec);
        let mux = ChannelMultiplexer::new(Arc::new(backend.clone()), Arc::clone(scheduler), config);
        let store = OptimisticStore::new(PAGES_TABLE, Arc::clone(scheduler), config.optimistic.clone());

        let confirmed: Confirmed = Arc::new(Mutex::new(BTreeMap::new()));
        let feed = Arc::clone(&confirmed);
        let changes = mux.subscribe_to_changes(
            &key,
            &spec,
            ChangeFilter::all().for_table(PAGES_TABLE),
            ChangeHandlers::on_any(move |change: &RowChange| apply_change(&feed, change)),
        );
        let follow = store.follow(&mux, &key, &spec);

        let peers = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&peers);
        let presence = mux.subscribe_to_presence(
            &key,
            &spec,
            PresenceHandlers::new().on_sync(move |all: &[PresencePeer]| {
                seen.store(all.len(), Ordering::Relaxed);
            }),
        );
        mux.track_presence(&key, &PresenceMeta::new(name.clone(), format!("Simulated {name}")))
            .with_context(|| format!("{name} could not publish presence"))?;

        Ok(Self {
            name,
            mux,
            store,
            confirmed,
            peers,
            _subscriptions: vec![changes, follow, presence],
        })
    }

    fn confirmed(&self) -> Vec<PageRecord> {
        self.confirmed.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    fn view(&self) -> Vec<PageRecord> {
        self.store.merged_view(&self.confirmed())
    }
}

fn apply_change(confirmed: &Mutex<BTreeMap<RecordId, PageRecord>>, change: &RowChange) {
    let mut rows = confirmed.lock().unwrap_or_else(PoisonError::into_inner);
    match change.event_type {
        RowEventType::Delete => {
            if let Some(id) = change.record_id() {
                rows.remove(id);
            }
        }
        RowEventType::Insert | RowEventType::Update => {
            if let Some(page) = change.new.clone().and_then(PageRecord::from_record) {
                rows.insert(page.id.clone(), page);
            }
        }
    }
}

pub async fn run(args: PagesArgs, config: RealtimeConfig, format: OutputFormat) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be at least 1");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
    let backend = MemoryBackend::new(Arc::clone(&scheduler));
    backend.set_remote_delay(Duration::from_millis(args.latency_ms));
    backend.set_echo_client_ref(!args.no_client_ref);
    for _ in 0..args.failures {
        backend.fail_next_remote(RemoteError::Permission("simulated policy rejection".into()));
    }

    let workspace = Uuid::new_v4();
    let spec = ChannelSpec::topic(format!("workspace:{workspace}"))
        .with_table(PAGES_TABLE)
        .filter_eq("workspace_id", workspace);
    let clients = (0..args.clients)
        .map(|index| Client::connect(index, &backend, &scheduler, &config, &spec))
        .collect::<anyhow::Result<Vec<_>>>()?;
    info!(clients = clients.len(), %workspace, "clients connected");

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for client in &clients {
        for n in 0..args.pages {
            let store = client.store.clone();
            let remote = backend.clone();
            let draft = PageRecord::draft(workspace, None, format!("{} page {n}", client.name));
            tasks.spawn(async move { store.create(&remote, draft).await });
        }
    }

    tokio::time::sleep(Duration::from_millis(args.latency_ms / 2)).await;
    let in_flight_view = clients.iter().map(|client| client.view().len()).max().unwrap_or(0);

    let (mut confirmed, mut rolled_back) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        match joined.context("create task panicked")? {
            Ok(_) => confirmed += 1,
            Err(error) => {
                rolled_back += 1;
                warn!(%error, "create rolled back");
            }
        }
    }

    let backend_ids: BTreeSet<RecordId> =
        backend.records::<PageRecord>().into_iter().map(|page| page.id).collect();
    let converged = clients.iter().all(|client| {
        client.store.is_empty()
            && client.view().into_iter().map(|page| page.id).collect::<BTreeSet<_>>() == backend_ids
    });

    let report = PagesReport {
        clients: clients.len(),
        attempted: clients.len() * args.pages,
        confirmed,
        rolled_back,
        backend_rows: backend_ids.len(),
        in_flight_view,
        converged,
        elapsed_ms: started.elapsed().as_millis(),
        per_client: clients
            .iter()
            .map(|client| ClientReport {
                name: client.name.clone(),
                visible: client.view().len(),
                pending: client.store.summary().total(),
                peers: client.peers.load(Ordering::Relaxed),
            })
            .collect(),
    };

    for client in &clients {
        client.mux.shutdown();
    }

    print_report(format, &report, render).context("failed to write report")?;
    anyhow::ensure!(report.converged, "clients did not converge on the backend's rows");
    Ok(())
}

fn render(report: &PagesReport) -> String {
    let mut out = format!(
        "{} creates from {} clients: {} confirmed, {} rolled back ({} ms)\n",
        report.attempted, report.clients, report.confirmed, report.rolled_back, report.elapsed_ms
    );
    out.push_str(&format!(
        "peak optimistic view {}, backend rows {}, converged: {}\n",
        report.in_flight_view, report.backend_rows, report.converged
    ));
    for client in &report.per_client {
        out.push_str(&format!(
            "  {:<10} visible {:>3}  pending {:>2}  peers {}\n",
            client.name, client.visible, client.pending, client.peers
        ));
    }
    out.trim_end().to_string()
}
