//! Evidence submission to the protocol precompiles.
//!
//! Proofs leave the node as pseudo-transactions addressed to one of four
//! fixed precompile addresses. Submission is fire-and-forget from the
//! detector's point of view; transient pool errors are retried with
//! exponential backoff up to a bounded number of attempts.

use crate::accountability::proof::{encode_proof, Proof, ProofType};
use crate::config::SubmissionSection;
use crate::metrics::metrics;
use crate::types::Address;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub const CHECK_ACCUSATION_ADDRESS: Address = Address::from_low_byte(252);
pub const CHECK_INNOCENCE_ADDRESS: Address = Address::from_low_byte(253);
pub const CHECK_MISBEHAVIOUR_ADDRESS: Address = Address::from_low_byte(254);
pub const CHECK_ENODE_ADDRESS: Address = Address::from_low_byte(255);

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Worth retrying: pool congestion, temporary connectivity loss.
    #[error("transient submission failure: {0}")]
    Transient(String),
    /// Not worth retrying: rejected payload, unknown precompile.
    #[error("permanent submission failure: {0}")]
    Permanent(String),
}

/// The transaction-pool collaborator. The core never interprets the on-chain
/// response.
pub trait EvidencePool: Send + Sync {
    fn submit(&self, to: Address, payload: Vec<u8>) -> Result<(), SubmitError>;
}

pub fn precompile_for(t: ProofType) -> Address {
    match t {
        ProofType::Misbehaviour => CHECK_MISBEHAVIOUR_ADDRESS,
        ProofType::Accusation => CHECK_ACCUSATION_ADDRESS,
        ProofType::Innocence => CHECK_INNOCENCE_ADDRESS,
    }
}

pub struct Submitter<P: EvidencePool> {
    pool: Arc<P>,
    cfg: SubmissionSection,
}

impl<P: EvidencePool> Submitter<P> {
    pub fn new(cfg: SubmissionSection, pool: Arc<P>) -> Self {
        Self { pool, cfg }
    }

    /// Worker loop: drains the detector's proof channel until shutdown.
    pub async fn run(self, mut proofs_rx: mpsc::UnboundedReceiver<Proof>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = proofs_rx.recv() => match maybe {
                    Some(proof) => self.submit_with_retry(proof).await,
                    None => break,
                },
            }
        }
        info!("evidence submitter stopped");
    }

    pub async fn submit_with_retry(&self, proof: Proof) {
        let to = precompile_for(proof.proof_type);
        let payload = encode_proof(&proof);
        let mut backoff = Duration::from_millis(self.cfg.backoff_base_ms);
        for attempt in 1..=self.cfg.max_attempts.max(1) {
            match self.pool.submit(to, payload.clone()) {
                Ok(()) => {
                    debug!(
                        kind = ?proof.proof_type,
                        rule = ?proof.rule,
                        offender = %proof.offender().to_hex(),
                        attempt,
                        "evidence submitted"
                    );
                    return;
                }
                Err(SubmitError::Permanent(reason)) => {
                    error!(kind = ?proof.proof_type, rule = ?proof.rule, reason, "evidence rejected");
                    metrics().submissions_failed.inc();
                    return;
                }
                Err(SubmitError::Transient(reason)) => {
                    if attempt == self.cfg.max_attempts.max(1) {
                        break;
                    }
                    metrics().submissions_retried.inc();
                    warn!(attempt, reason, "evidence submission deferred");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
        metrics().submissions_failed.inc();
        error!(
            kind = ?proof.proof_type,
            rule = ?proof.rule,
            offender = %proof.offender().to_hex(),
            "evidence submission abandoned after retries"
        );
    }
}
