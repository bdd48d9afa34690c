// `doc`: several replicas of one text field edit at once and must converge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tracing::info;

use pagesync_common::crdt::envelope::DocId;
use pagesync_common::types::RecordId;
use pagesync_realtime::crdt::{document_channel, TextReplica};
use pagesync_realtime::scheduler::Scheduler;
use pagesync_realtime::{
    ChannelMultiplexer, CrdtSynchronizer, MemoryBackend, RealtimeConfig, ReplicaPhase, Seed,
    TokioScheduler,
};

use crate::output::{print_report, OutputFormat};

#[derive(Args, Debug)]
pub struct DocArgs {
    #[arg(long, default_value_t = 3)]
    pub clients: usize,
    /// Edit rounds; every client makes one edit per round
    #[arg(long, default_value_t = 10)]
    pub edits: usize,
    /// Text every replica starts from
    #[arg(long, default_value = "")]
    pub seed: String,
    /// Include the final document text in the report
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct ReplicaReport {
    sender_id: String,
    phase: String,
    length: usize,
    sent: u64,
    applied: u64,
    self_echoes: u64,
    rejected: u64,
    held: u64,
}

#[derive(Debug, Serialize)]
struct DocReport {
    doc_id: String,
    clients: usize,
    edits: usize,
    converged: bool,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    replicas: Vec<ReplicaReport>,
}

struct Replica {
    mux: ChannelMultiplexer,
    sync: CrdtSynchronizer,
}

/// One shared starting state, so every replica holds the same seed items.
fn seed_state(text: &str, text_name: &str) -> Seed {
    if text.is_empty() {
        return Seed::Empty;
    }
    let origin = TextReplica::new(text_name);
    origin.seed_text(text);
    Seed::State(origin.encode_state())
}

/// Deterministic spread of edit positions across the document.
fn position(round: usize, client: usize, len: usize) -> u32 {
    let at = (round * 31 + client * 17) % (len + 1);
    u32::try_from(at).unwrap_or(u32::MAX)
}

pub async fn run(args: DocArgs, config: RealtimeConfig, format: OutputFormat) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be at least 1");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
    let backend = MemoryBackend::new(Arc::clone(&scheduler));
    let record = RecordId::generate();
    let spec = document_channel(&record);
    let doc_id = DocId::for_field(&record, &config.crdt.text_name);
    let seed = seed_state(&args.seed, &config.crdt.text_name);

    let replicas = (0..args.clients)
        .map(|index| -> anyhow::Result<Replica> {
            let mux = ChannelMultiplexer::new(Arc::new(backend.clone()), Arc::clone(&scheduler), &config);
            let sync = CrdtSynchronizer::mount(
                &mux,
                &spec,
                doc_id.clone(),
                format!("client-{index}"),
                &config.crdt,
                seed.clone(),
            )
            .with_context(|| format!("client-{index} failed to mount {doc_id}"))?;
            Ok(Replica { mux, sync })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    tokio::time::sleep(config.crdt.live_delay() * 2 + Duration::from_millis(10)).await;
    let waiting = replicas.iter().filter(|r| r.sync.phase() != ReplicaPhase::Live).count();
    anyhow::ensure!(waiting == 0, "{waiting} replica(s) never went live");
    info!(%doc_id, clients = replicas.len(), "replicas live");

    let started = Instant::now();
    for round in 0..args.edits {
        for (index, replica) in replicas.iter().enumerate() {
            let len = replica.sync.get_document_content().chars().count();
            let tag = char::from(b'a' + (index % 26) as u8);
            if round % 4 == 3 && len > 0 {
                replica.sync.remove(position(round, index, len - 1), 1);
            } else {
                replica.sync.insert(position(round, index, len), &format!("{tag}{round} "));
            }
        }
        tokio::task::yield_now().await;
    }

    let contents: Vec<String> = replicas.iter().map(|r| r.sync.get_document_content()).collect();
    let converged = contents.windows(2).all(|pair| pair[0] == pair[1]);
    let report = DocReport {
        doc_id: doc_id.to_string(),
        clients: replicas.len(),
        edits: args.edits,
        converged,
        elapsed_ms: started.elapsed().as_millis(),
        content: args.show.then(|| contents.first().cloned().unwrap_or_default()),
        replicas: replicas
            .iter()
            .map(|replica| {
                let stats = replica.sync.stats();
                ReplicaReport {
                    sender_id: replica.sync.sender_id().to_string(),
                    phase: replica.sync.phase().to_string(),
                    length: replica.sync.get_document_content().chars().count(),
                    sent: stats.sent,
                    applied: stats.applied,
                    self_echoes: stats.self_echoes,
                    rejected: stats.rejected,
                    held: stats.held,
                }
            })
            .collect(),
    };

    for replica in &replicas {
        replica.sync.close();
        replica.mux.shutdown();
    }

    print_report(format, &report, render).context("failed to write report")?;
    anyhow::ensure!(report.converged, "replicas diverged");
    Ok(())
}

fn render(report: &DocReport) -> String {
    let mut out = format!(
        "{} replicas x {} edits on {}: converged: {} ({} ms)\n",
        report.clients, report.edits, report.doc_id, report.converged, report.elapsed_ms
    );
    for replica in &report.replicas {
        out.push_str(&format!(
            "  {:<10} {:<6} len {:>4}  sent {:>3}  applied {:>3}  held {:>2}  rejected {}\n",
            replica.sender_id,
            replica.phase,
            replica.length,
            replica.sent,
            replica.applied,
            replica.held,
            replica.rejected
        ));
    }
    if let Some(content) = &report.content {
        out.push_str(&format!("\n{content}\n"));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_stay_inside_the_document() {
        for round in 0..50 {
            for client in 0..5 {
                assert!(position(round, client, 7) <= 7);
            }
        }
        assert_eq!(position(3, 2, 0), 0);
    }

    #[test]
    fn empty_seed_text_mounts_empty() {
        assert!(matches!(seed_state("", "content"), Seed::Empty));
        assert!(matches!(seed_state("hi", "content"), Seed::State(state) if !state.is_empty()));
    }
}
