use crate::consensus::committee::Committee;
use crate::crypto::SignatureBytes;
use crate::types::{Address, Block, BlockHeader, Height, Round};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("proposal rejected: {0}")]
    InvalidProposal(String),
    #[error("commit failed: {0}")]
    Commit(String),
}

/// Everything the consensus core needs from the rest of the node: identity
/// and signing, transport fan-out, block verification and the commit path.
/// Implementations must be callable from the event-loop thread without
/// blocking on network or disk inside the core's critical sections.
pub trait Backend: Send + Sync {
    fn address(&self) -> Address;

    fn sign(&self, payload: &[u8]) -> SignatureBytes;

    /// Committee authorised to decide `height`.
    fn committee(&self, height: Height) -> Committee;

    /// Send a payload to every committee member, including the local node.
    fn broadcast(&self, committee: &Committee, payload: Vec<u8>);

    /// Relay a payload the local node already processed.
    fn gossip(&self, committee: &Committee, payload: Vec<u8>);

    /// Verify a proposed block against its parent. `Ok` carries the delay
    /// until the block's timestamp is reachable; the core calls this exactly
    /// once per value.
    fn verify_proposal(&self, block: &Block) -> Result<Duration, BackendError>;

    fn last_committed_proposal(&self) -> (Block, Address);

    /// Hand the decided block and its quorum-certificate seals to the
    /// execution collaborator. A `CommitEvent` follows once applied.
    fn commit(&self, block: &Block, round: Round, seals: Vec<SignatureBytes>)
        -> Result<(), BackendError>;

    /// Ask the network for the consensus state at `header`'s successor.
    fn ask_sync(&self, header: &BlockHeader);

    /// Replay our current-height messages to a lagging peer.
    fn sync_peer(&self, addr: Address);
}
