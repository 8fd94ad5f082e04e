//! Multi-validator consensus scenarios.
//!
//! Four equal-weight validators run in-process; the test harness plays the
//! network, delivering broadcast payloads synchronously and firing timeouts
//! by hand. Quorum is 3, fault threshold 1.

use naxos::config::ConsensusSection;
use naxos::consensus::{
    proposal_sign_bytes, Backend, BackendError, Committee, CommitteeMember, ConsensusError,
    ConsensusMsg, Engine, Message, MsgStore, Proposal, Step, TimeoutEvent, MSG_PRECOMMIT,
    MSG_PROPOSAL,
};
use naxos::crypto::ed25519::{Ed25519Keypair, Ed25519Verifier};
use naxos::crypto::{SignatureBytes, Signer};
use naxos::types::{payload_root, Address, Block, BlockHeader, Hash32, Height, Round};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Recording backend ─────────────────────────────────────────────────────

struct RecordingBackend {
    key: Ed25519Keypair,
    committee: Committee,
    outbox: Mutex<Vec<Vec<u8>>>,
    commits: Mutex<Vec<(Block, Round, Vec<SignatureBytes>)>>,
    last_committed: Mutex<(Block, Address)>,
    reject_proposals: AtomicBool,
}

impl Backend for RecordingBackend {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn sign(&self, payload: &[u8]) -> SignatureBytes {
        self.key.sign(payload)
    }

    fn committee(&self, _height: Height) -> Committee {
        self.committee.clone()
    }

    fn broadcast(&self, _committee: &Committee, payload: Vec<u8>) {
        self.outbox.lock().push(payload);
    }

    fn gossip(&self, _committee: &Committee, _payload: Vec<u8>) {}

    fn verify_proposal(&self, _block: &Block) -> Result<Duration, BackendError> {
        if self.reject_proposals.load(Ordering::Relaxed) {
            return Err(BackendError::InvalidProposal("payload rejected".into()));
        }
        Ok(Duration::ZERO)
    }

    fn last_committed_proposal(&self) -> (Block, Address) {
        self.last_committed.lock().clone()
    }

    fn commit(
        &self,
        block: &Block,
        round: Round,
        seals: Vec<SignatureBytes>,
    ) -> Result<(), BackendError> {
        self.commits.lock().push((block.clone(), round, seals));
        Ok(())
    }

    fn ask_sync(&self, _header: &BlockHeader) {}

    fn sync_peer(&self, _addr: Address) {}
}

// ── Harness ───────────────────────────────────────────────────────────────

type TestEngine = Engine<RecordingBackend, Ed25519Verifier>;

struct TestNet {
    engines: Vec<TestEngine>,
    backends: Vec<Arc<RecordingBackend>>,
    stores: Vec<Arc<MsgStore>>,
    genesis: Block,
}

fn make_block(height: Height, parent: Hash32, proposer: Address, salt: u8) -> Block {
    let payload = vec![salt; 4];
    Block {
        header: BlockHeader {
            height,
            round: 0,
            parent,
            proposer,
            timestamp: height * 1000,
            payload_root: payload_root(&payload),
        },
        payload,
    }
}

impl TestNet {
    fn new(n: usize) -> Self {
        let keys: Vec<Ed25519Keypair> = (1..=n as u8)
            .map(|i| {
                let mut seed = [0u8; 32];
                seed[0] = i;
                Ed25519Keypair::from_seed(seed)
            })
            .collect();
        let committee = Committee::new(
            keys.iter()
                .map(|k| CommitteeMember {
                    address: k.address(),
                    consensus_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
        );
        let genesis = make_block(9, Hash32::zero(), committee.members()[0].address, 0);

        let backends: Vec<Arc<RecordingBackend>> = keys
            .into_iter()
            .map(|key| {
                Arc::new(RecordingBackend {
                    key,
                    committee: committee.clone(),
                    outbox: Mutex::new(vec![]),
                    commits: Mutex::new(vec![]),
                    last_committed: Mutex::new((genesis.clone(), committee.members()[0].address)),
                    reject_proposals: AtomicBool::new(false),
                })
            })
            .collect();
        let stores: Vec<Arc<MsgStore>> = (0..n).map(|_| Arc::new(MsgStore::new())).collect();
        let engines = backends
            .iter()
            .zip(stores.iter())
            .map(|(b, s)| {
                TestEngine::new(ConsensusSection::default(), Arc::clone(b), Arc::clone(s), None)
            })
            .collect();
        Self { engines, backends, stores, genesis }
    }

    fn committee(&self) -> &Committee {
        &self.backends[0].committee
    }

    fn proposer_index(&self, height: Height, round: Round) -> usize {
        let proposer = self.committee().proposer_for(height, round).address;
        self.backends.iter().position(|b| b.address() == proposer).unwrap()
    }

    fn start_all(&mut self, skip: &[usize]) {
        for (i, e) in self.engines.iter_mut().enumerate() {
            if !skip.contains(&i) {
                e.start_round(0);
            }
        }
    }

    /// Drain every outbox and deliver each payload to the engines the filter
    /// admits, until the network is quiet. The filter sees the payload's code
    /// byte and the receiver index; senders receive their own messages too.
    fn route_where(&mut self, admit: impl Fn(u8, usize) -> bool) {
        for _ in 0..64 {
            let mut pending: Vec<Vec<u8>> = Vec::new();
            for b in &self.backends {
                pending.extend(b.outbox.lock().drain(..));
            }
            if pending.is_empty() {
                return;
            }
            for payload in pending {
                let code = payload[0];
                for (i, e) in self.engines.iter_mut().enumerate() {
                    if admit(code, i) {
                        let _ = e.handle_message(payload.clone());
                    }
                }
            }
        }
        panic!("network failed to quiesce");
    }

    fn route(&mut self) {
        self.route_where(|_, _| true);
    }

    /// Apply the first recorded commit on every node that produced one, then
    /// let the engines advance height.
    fn apply_commits(&mut self) -> Vec<(Block, Round, Vec<SignatureBytes>)> {
        let mut applied = Vec::new();
        for (i, b) in self.backends.iter().enumerate() {
            let commit = b.commits.lock().first().cloned();
            if let Some((block, round, seals)) = commit {
                *b.last_committed.lock() = (block.clone(), block.header.proposer);
                self.engines[i].handle_commit_event();
                self.engines[i].pump();
                applied.push((block, round, seals));
            }
        }
        applied
    }

    fn fire_timeout(&mut self, idx: usize, step: Step, height: Height, round: Round) {
        self.engines[idx].on_timeout(TimeoutEvent { step, height, round });
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────

/// S1: honest proposer, everyone votes, block commits at round 0 with a
/// quorum certificate of at least 3 seals.
#[tokio::test]
async fn happy_path_commits_at_round_zero() {
    let mut net = TestNet::new(4);
    net.start_all(&[]);

    let proposer = net.proposer_index(10, 0);
    let block = make_block(10, net.genesis.id(), net.backends[proposer].address(), 1);
    for e in net.engines.iter_mut() {
        e.handle_new_unmined_block(block.clone());
    }
    net.route();

    let applied = net.apply_commits();
    assert_eq!(applied.len(), 4, "every validator should commit");
    for (committed, round, seals) in applied {
        assert_eq!(committed.id(), block.id());
        assert_eq!(round, 0);
        assert!(seals.len() >= 3, "quorum certificate needs >= 3 seals, got {}", seals.len());
    }
    for e in &net.engines {
        assert_eq!(e.height(), 11);
        assert_eq!(e.round(), 0);
    }
}

/// S2: the round-0 proposer is silent; the others prevote NIL on propose
/// timeout, precommit NIL, enter round 1 and commit there.
#[tokio::test]
async fn silent_proposer_commits_at_round_one() {
    let mut net = TestNet::new(4);
    let silent = net.proposer_index(10, 0);
    let live: Vec<usize> = (0..4).filter(|i| *i != silent).collect();
    net.start_all(&[silent]);

    for &i in &live {
        net.fire_timeout(i, Step::Propose, 10, 0);
    }
    net.route_where(|_, to| live.contains(&to));
    for &i in &live {
        assert_eq!(net.engines[i].step(), Step::Precommit, "NIL prevote quorum must precommit");
    }
    // nothing can commit at round 0; precommit timers fire
    for &i in &live {
        net.fire_timeout(i, Step::Precommit, 10, 0);
        assert_eq!(net.engines[i].round(), 1);
    }

    let next = net.proposer_index(10, 1);
    assert_ne!(next, silent);
    let block = make_block(10, net.genesis.id(), net.backends[next].address(), 2);
    for &i in &live {
        net.engines[i].handle_new_unmined_block(block.clone());
    }
    net.route_where(|_, to| live.contains(&to));

    let applied = net.apply_commits();
    assert_eq!(applied.len(), 3);
    for (committed, round, _seals) in applied {
        assert_eq!(committed.id(), block.id());
        assert_eq!(round, 1);
    }
}

/// S4: nodes lock B at round 0 but the precommit quorum is suppressed; a
/// node that saw nothing proposes fresh at round 1 and is voted down by the
/// locked majority; at round 2 a locked proposer re-proposes B with
/// valid_round 0 and everyone commits it.
#[tokio::test]
async fn locked_nodes_refuse_fresh_value_then_accept_old_quorum() {
    let mut net = TestNet::new(4);
    let p0 = net.proposer_index(10, 0);
    let dark = net.proposer_index(10, 1);
    assert_ne!(p0, dark);
    let informed: Vec<usize> = (0..4).filter(|i| *i != dark).collect();
    net.start_all(&[]);

    let block_b = make_block(10, net.genesis.id(), net.backends[p0].address(), 1);
    net.engines[p0].handle_new_unmined_block(block_b.clone());
    // proposal and prevotes reach the informed majority; every precommit is
    // lost, so no commit quorum can form at round 0
    net.route_where(|code, to| informed.contains(&to) && code != MSG_PRECOMMIT);
    for &i in &informed {
        assert_eq!(net.engines[i].round_state().locked_value, Some(block_b.id()));
        assert_eq!(net.engines[i].round_state().locked_round, Some(0));
    }
    assert!(net.backends.iter().all(|b| b.commits.lock().is_empty()));

    // round 1: the dark node proposes a fresh B'
    for i in 0..4 {
        net.fire_timeout(i, Step::Precommit, 10, 0);
        assert_eq!(net.engines[i].round(), 1);
    }
    let block_b2 = make_block(10, net.genesis.id(), net.backends[dark].address(), 7);
    net.engines[dark].handle_new_unmined_block(block_b2.clone());
    net.route();
    // the locked majority prevoted NIL against B'
    assert!(net.backends.iter().all(|b| b.commits.lock().is_empty()));

    // round 2: a locked proposer re-proposes B with valid_round = 0
    for i in 0..4 {
        net.fire_timeout(i, Step::Precommit, 10, 1);
    }
    let p2 = net.proposer_index(10, 2);
    assert_ne!(p2, dark, "round-2 proposer must be one of the locked nodes");
    net.route();

    let applied = net.apply_commits();
    assert!(applied.len() >= 3, "locked majority plus the dark node should commit B");
    for (committed, round, _) in applied {
        assert_eq!(committed.id(), block_b.id());
        assert_eq!(round, 2);
    }
}

/// An invalid proposal draws NIL prevotes from every node that rejects it.
#[tokio::test]
async fn invalid_proposal_draws_nil_prevotes() {
    let mut net = TestNet::new(4);
    let proposer = net.proposer_index(10, 0);
    for (i, b) in net.backends.iter().enumerate() {
        if i != proposer {
            b.reject_proposals.store(true, Ordering::Relaxed);
        }
    }
    net.start_all(&[]);
    let block = make_block(10, net.genesis.id(), net.backends[proposer].address(), 1);
    net.engines[proposer].handle_new_unmined_block(block);
    net.route();

    for (i, e) in net.engines.iter().enumerate() {
        if i != proposer {
            assert_eq!(e.step(), Step::Precommit, "NIL quorum should move nodes to precommit");
        }
    }
    assert!(net.backends.iter().all(|b| b.commits.lock().is_empty()));
}

/// S6 tail: timeout events for a view the engine has left are ignored.
#[tokio::test]
async fn stale_timeouts_are_ignored() {
    let mut net = TestNet::new(4);
    net.start_all(&[]);
    let idx = (0..4).find(|i| *i != net.proposer_index(10, 0)).unwrap();

    net.fire_timeout(idx, Step::Propose, 10, 5);
    assert_eq!(net.engines[idx].step(), Step::Propose, "wrong round must not fire");
    net.fire_timeout(idx, Step::Propose, 11, 0);
    assert_eq!(net.engines[idx].step(), Step::Propose, "wrong height must not fire");

    net.fire_timeout(idx, Step::Propose, 10, 0);
    assert_eq!(net.engines[idx].step(), Step::Prevote, "matching view fires");
}

/// Messages for a future height are buffered in the store and replayed once
/// the height becomes current.
#[tokio::test]
async fn future_height_messages_are_buffered_and_replayed() {
    let mut net = TestNet::new(4);
    net.start_all(&[]);

    let proposer = net.proposer_index(10, 0);
    let block = make_block(10, net.genesis.id(), net.backends[proposer].address(), 1);
    for e in net.engines.iter_mut() {
        e.handle_new_unmined_block(block.clone());
    }
    net.route();

    // p11 applies its commit first and proposes for height 11
    let p11 = net.proposer_index(11, 0);
    let block11 = make_block(11, block.id(), net.backends[p11].address(), 3);
    let commit = net.backends[p11].commits.lock().first().cloned().unwrap();
    *net.backends[p11].last_committed.lock() = (commit.0.clone(), commit.0.header.proposer);
    net.engines[p11].handle_commit_event();
    net.engines[p11].pump();
    assert_eq!(net.engines[p11].height(), 11);
    net.engines[p11].handle_new_unmined_block(block11.clone());
    let payload = net.backends[p11].outbox.lock().pop().expect("proposal for height 11");

    // a node still at height 10 buffers it
    let lagger = (0..4).find(|i| *i != p11).unwrap();
    let err = net.engines[lagger].handle_message(payload).unwrap_err();
    assert!(matches!(err, ConsensusError::FutureHeight));
    assert!(err.is_benign() && err.regossip());
    assert_eq!(net.stores[lagger].get(11, |_| true).len(), 1);

    // once the lagger applies its own commit, the buffered proposal replays
    let commit = net.backends[lagger].commits.lock().first().cloned().unwrap();
    *net.backends[lagger].last_committed.lock() = (commit.0.clone(), commit.0.header.proposer);
    net.engines[lagger].handle_commit_event();
    net.engines[lagger].pump();

    assert_eq!(net.engines[lagger].height(), 11);
    assert_eq!(
        net.engines[lagger].round_state().proposed_block_hash,
        Some(block11.id()),
        "replayed proposal must be picked up at the new height"
    );
}

/// Byte-identical duplicates are benign; a second distinct proposal from the
/// same proposer is rejected by the cache but both copies stay in the store
/// as the equivocation pair.
#[tokio::test]
async fn duplicate_and_equivocating_proposals() {
    let mut net = TestNet::new(4);
    net.start_all(&[]);
    let proposer = net.proposer_index(10, 0);
    let victim = (0..4).find(|i| *i != proposer).unwrap();

    let block = make_block(10, net.genesis.id(), net.backends[proposer].address(), 1);
    net.engines[proposer].handle_new_unmined_block(block.clone());
    let payload = net.backends[proposer].outbox.lock().pop().unwrap();

    net.engines[victim].handle_message(payload.clone()).unwrap();
    let dup = net.engines[victim].handle_message(payload).unwrap_err();
    assert!(matches!(dup, ConsensusError::Duplicate));
    assert!(dup.is_benign());

    // equivocating proposal: same round, different block, properly signed
    let block2 = make_block(10, net.genesis.id(), net.backends[proposer].address(), 9);
    let value2 = block2.id();
    let signature = net.backends[proposer].sign(&proposal_sign_bytes(10, 0, None, &value2));
    let equivocation = Message::new(ConsensusMsg::Proposal(Proposal {
        height: 10,
        round: 0,
        valid_round: None,
        block: block2,
        sender: net.backends[proposer].address(),
        signature,
    }));
    let err = net.engines[victim]
        .handle_message(equivocation.payload().to_vec())
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Cache(_)));
    assert!(err.is_benign());
    assert!(!err.penalise_sender());

    let stored = net.stores[victim].get(10, |m| {
        m.code() == MSG_PROPOSAL && m.sender() == net.backends[proposer].address()
    });
    assert_eq!(stored.len(), 2, "equivocation pair must survive in the store");
}

/// The quorum certificate carries at most one seal per sender even when the
/// store holds duplicates.
#[tokio::test]
async fn certificate_has_one_seal_per_sender() {
    let mut net = TestNet::new(4);
    net.start_all(&[]);
    let proposer = net.proposer_index(10, 0);
    let block = make_block(10, net.genesis.id(), net.backends[proposer].address(), 1);
    for e in net.engines.iter_mut() {
        e.handle_new_unmined_block(block.clone());
    }
    net.route();
    let applied = net.apply_commits();
    assert_eq!(applied.len(), 4);
    for (_, _, seals) in applied {
        assert!((3..=4).contains(&seals.len()));
    }
}
