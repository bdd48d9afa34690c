// Replicas converge no matter how the relay orders or repeats deltas.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pagesync_common::crdt::envelope::DocId;
use pagesync_realtime::config::CrdtConfig;
use pagesync_realtime::crdt::replica::REMOTE_ORIGIN;
use pagesync_realtime::crdt::{document_channel, TextReplica};
use pagesync_realtime::{
    ChannelMultiplexer, CrdtSynchronizer, ManualScheduler, MemoryBackend, RealtimeConfig, Seed,
};
use proptest::prelude::*;
use serde_json::json;

const TEXT: &str = "content";

#[derive(Debug, Clone)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        self.state >> 11
    }

    fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        (self.next_u64() as usize) % bound
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            items.swap(i, self.below(i + 1));
        }
    }
}

/// A locally produced delta and the author's state vector before it.
#[derive(Debug, Clone)]
struct Authored {
    delta: Vec<u8>,
    context: Vec<u8>,
}

/// An editing replica that records every delta it produces locally.
struct Author {
    _observer: yrs::Subscription,
    replica: TextReplica,
    deltas: Arc<Mutex<Vec<Authored>>>,
}

impl Author {
    fn new(client_id: u64) -> Self {
        let replica = TextReplica::with_client_id(client_id, TEXT);
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let observer = replica
            .observe_updates(move |notice| {
                if notice.origin.is_none() {
                    sink.lock()
                        .expect("delta log lock")
                        .push(Authored { delta: notice.update.to_vec(), context: notice.context() });
                }
            })
            .expect("observer registers");
        Self { _observer: observer, replica, deltas }
    }

    fn edit(&self, rng: &mut Lcg) {
        let len = self.replica.len() as usize;
        if len == 0 || rng.below(3) > 0 {
            let at = rng.below(len + 1) as u32;
            let chunk: String =
                (0..1 + rng.below(5)).map(|_| char::from(b'a' + rng.below(26) as u8)).collect();
            self.replica.insert(at, &chunk);
        } else {
            let at = rng.below(len);
            let span = 1 + rng.below((len - at).min(4));
            self.replica.remove(at as u32, span as u32);
        }
    }

    fn deltas(&self) -> Vec<Authored> {
        self.deltas.lock().expect("delta log lock").clone()
    }
}

fn pull(source: &TextReplica, target: &TextReplica) {
    let diff = source.encode_diff(&target.encode_state_vector()).expect("state vector decodes");
    target.apply_update(&diff, REMOTE_ORIGIN).expect("diff applies");
}

fn settle(authors: &[Author]) {
    for _ in 0..2 {
        for from in authors {
            for to in authors {
                if !std::ptr::eq(from, to) {
                    pull(&from.replica, &to.replica);
                }
            }
        }
    }
}

/// Authors edit, occasionally seeing each other's work first, so later deltas
/// depend on earlier ones from other authors.
fn author_session(seed: u64, edits: usize) -> (Vec<Author>, Vec<Authored>) {
    let authors: Vec<Author> = (1..=3).map(Author::new).collect();
    let mut rng = Lcg::new(seed);
    for _ in 0..edits {
        let actor = rng.below(authors.len());
        authors[actor].edit(&mut rng);
        if rng.below(4) == 0 {
            let from = rng.below(authors.len());
            let to = (from + 1 + rng.below(authors.len() - 1)) % authors.len();
            pull(&authors[from].replica, &authors[to].replica);
        }
    }
    let deltas = authors.iter().flat_map(Author::deltas).collect();
    settle(&authors);
    (authors, deltas)
}

/// Every delta at least once, some twice, in an arbitrary order.
fn scrambled(deltas: &[Authored], rng: &mut Lcg) -> Vec<Authored> {
    let mut out = deltas.to_vec();
    for delta in deltas {
        if rng.below(5) == 0 {
            out.push(delta.clone());
        }
    }
    rng.shuffle(&mut out);
    out
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, ..ProptestConfig::default() })]

    #[test]
    fn receivers_converge_under_reordering_and_duplication(
        seed in any::<u64>(),
        order_seed in any::<u64>(),
        edits in 1usize..80,
    ) {
        let (authors, deltas) = author_session(seed, edits);
        let expected = authors[0].replica.content();
        for author in &authors[1..] {
            prop_assert_eq!(author.replica.content(), expected.clone());
        }

        let mut rng = Lcg::new(order_seed);
        let receivers: Vec<TextReplica> =
            (10..12).map(|id| TextReplica::with_client_id(id, TEXT)).collect();
        for receiver in &receivers {
            let relayed = scrambled(&deltas, &mut rng);
            let mut applied = 0;
            for authored in &relayed {
                let delivery = receiver
                    .receive(&authored.delta, Some(&authored.context), REMOTE_ORIGIN)
                    .expect("delta decodes");
                applied += delivery.applied;
            }
            prop_assert_eq!(receiver.held(), 0);
            prop_assert_eq!(applied, relayed.len());
            prop_assert_eq!(receiver.content(), expected.clone());
        }
    }

    #[test]
    fn synchronizer_applies_relayed_envelopes_in_any_order(
        seed in any::<u64>(),
        order_seed in any::<u64>(),
        edits in 1usize..40,
    ) {
        let (authors, deltas) = author_session(seed, edits);
        let scheduler = Arc::new(ManualScheduler::new());
        let backend = Arc::new(MemoryBackend::new(scheduler.clone()));
        let mux = ChannelMultiplexer::new(backend, scheduler.clone(), &RealtimeConfig::default());
        let doc_id = DocId::for_field("page-1", TEXT);
        let listener = CrdtSynchronizer::mount(
            &mux,
            &document_channel(&"page-1".into()),
            doc_id.clone(),
            "listener",
            &CrdtConfig::default(),
            Seed::Empty,
        )
        .expect("mount should succeed");
        scheduler.advance(Duration::from_millis(100));

        let mut rng = Lcg::new(order_seed);
        let relayed = scrambled(&deltas, &mut rng);
        for authored in &relayed {
            let envelope = json!({
                "docId": doc_id.to_string(),
                "senderId": "author",
                "delta": BASE64.encode(&authored.delta),
                "context": BASE64.encode(&authored.context),
                "timestamp": "2026-01-01T00:00:00Z",
            });
            listener.receive(&envelope).expect("envelope decodes");
        }

        let stats = listener.stats();
        prop_assert_eq!(listener.get_document_content(), authors[0].replica.content());
        prop_assert_eq!(stats.applied, relayed.len() as u64);
        prop_assert_eq!(stats.held, 0);
        prop_assert_eq!(stats.dropped, 0);
        prop_assert_eq!(stats.sent, 0);
    }
}
