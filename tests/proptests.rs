use proptest::prelude::*;

use naxos::accountability::{decode_proof, encode_proof, Proof, ProofType, Rule};
use naxos::consensus::{
    decode_msg, encode_msg, ConsensusMsg, LightProposal, Message, MsgStore, Precommit, Prevote,
    Proposal, RoundState,
};
use naxos::crypto::SignatureBytes;
use naxos::types::{payload_root, Address, Block, BlockHeader, Hash32, MAX_ROUND};
use std::sync::Arc;

fn arb_hash() -> impl Strategy<Value = Hash32> {
    any::<[u8; 32]>().prop_map(Hash32)
}

fn arb_addr() -> impl Strategy<Value = Address> {
    any::<[u8; 20]>().prop_map(Address)
}

fn arb_sig() -> impl Strategy<Value = SignatureBytes> {
    proptest::collection::vec(any::<u8>(), 0..96).prop_map(SignatureBytes)
}

fn arb_round() -> impl Strategy<Value = u64> {
    0..=MAX_ROUND
}

fn arb_valid_round() -> impl Strategy<Value = Option<u64>> {
    prop_oneof![Just(None), (0..=MAX_ROUND).prop_map(Some)]
}

fn arb_value() -> impl Strategy<Value = Option<Hash32>> {
    prop_oneof![Just(None), arb_hash().prop_map(Some)]
}

fn arb_block() -> impl Strategy<Value = Block> {
    (
        any::<u64>(),
        arb_round(),
        arb_hash(),
        arb_addr(),
        any::<u64>(),
        proptest::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(height, round, parent, proposer, timestamp, payload)| Block {
            header: BlockHeader {
                height,
                round,
                parent,
                proposer,
                timestamp,
                payload_root: payload_root(&payload),
            },
            payload,
        })
}

fn arb_msg() -> impl Strategy<Value = ConsensusMsg> {
    prop_oneof![
        (any::<u64>(), arb_round(), arb_valid_round(), arb_block(), arb_addr(), arb_sig()).prop_map(
            |(height, round, valid_round, block, sender, signature)| {
                ConsensusMsg::Proposal(Proposal { height, round, valid_round, block, sender, signature })
            }
        ),
        (any::<u64>(), arb_round(), arb_value(), arb_addr(), arb_sig()).prop_map(
            |(height, round, value, sender, signature)| {
                ConsensusMsg::Prevote(Prevote { height, round, value, sender, signature })
            }
        ),
        (any::<u64>(), arb_round(), arb_value(), arb_sig(), arb_addr(), arb_sig()).prop_map(
            |(height, round, value, committed_seal, sender, signature)| {
                ConsensusMsg::Precommit(Precommit {
                    height,
                    round,
                    value,
                    committed_seal,
                    sender,
                    signature,
                })
            }
        ),
        (any::<u64>(), arb_round(), arb_valid_round(), arb_hash(), arb_addr(), arb_sig()).prop_map(
            |(height, round, valid_round, value, sender, signature)| {
                ConsensusMsg::LightProposal(LightProposal {
                    height,
                    round,
                    valid_round,
                    value,
                    sender,
                    signature,
                })
            }
        ),
    ]
}

fn arb_vote_msg() -> impl Strategy<Value = ConsensusMsg> {
    (any::<u64>(), arb_round(), arb_value(), arb_addr(), arb_sig()).prop_map(
        |(height, round, value, sender, signature)| {
            ConsensusMsg::Prevote(Prevote { height, round, value, sender, signature })
        },
    )
}

proptest! {
    /// encode . decode = id for every message kind, nil valid_round included.
    #[test]
    fn message_codec_roundtrip(msg in arb_msg()) {
        let encoded = encode_msg(&msg);
        let decoded = decode_msg(&encoded).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    /// The content hash is over the exact payload bytes, so re-encoding a
    /// decoded message reproduces the same hash.
    #[test]
    fn message_hash_is_stable(msg in arb_msg()) {
        let m1 = Message::new(msg);
        let m2 = Message::decode(m1.payload().to_vec()).unwrap();
        prop_assert_eq!(m1.hash(), m2.hash());
    }

    /// Proof envelope round-trips preserving type, rule and evidence order.
    #[test]
    fn proof_codec_roundtrip(
        msg in arb_vote_msg(),
        evs in proptest::collection::vec(arb_vote_msg(), 0..5),
        type_ix in 0u8..3,
        rule_ix in 0u8..6,
    ) {
        let proof = Proof {
            proof_type: ProofType::try_from(type_ix).unwrap(),
            rule: Rule::try_from(rule_ix).unwrap(),
            message: Arc::new(Message::new(msg)),
            evidences: evs.into_iter().map(|m| Arc::new(Message::new(m))).collect(),
        };
        let decoded = decode_proof(&encode_proof(&proof)).unwrap();
        prop_assert_eq!(decoded.proof_type, proof.proof_type);
        prop_assert_eq!(decoded.rule, proof.rule);
        prop_assert_eq!(decoded.message.hash(), proof.message.hash());
        let got: Vec<_> = decoded.evidences.iter().map(|m| m.hash()).collect();
        let want: Vec<_> = proof.evidences.iter().map(|m| m.hash()).collect();
        prop_assert_eq!(got, want);
    }

    /// Store laws: everything saved at a height is returned by get; nothing
    /// at or below the deletion point survives.
    #[test]
    fn store_save_get_delete_laws(
        msgs in proptest::collection::vec(arb_vote_msg(), 1..24),
        cut in 0..u64::MAX,
    ) {
        let store = MsgStore::new();
        let msgs: Vec<_> = msgs.into_iter().map(|m| Arc::new(Message::new(m))).collect();
        for m in &msgs {
            store.save(Arc::clone(m));
        }
        for m in &msgs {
            let hits = store.get(m.height(), |x| x.hash() == m.hash());
            prop_assert!(!hits.is_empty());
        }
        store.delete_before(cut);
        prop_assert!(store.first_height_buffered() > cut);
        for m in &msgs {
            let hits = store.get(m.height(), |x| x.hash() == m.hash());
            prop_assert_eq!(hits.is_empty(), m.height() <= cut);
        }
    }

    /// Round-state invariants hold under lock/valid updates at increasing
    /// rounds: locked_round is None exactly when locked_value is, and
    /// valid_round never trails locked_round.
    #[test]
    fn round_state_invariants(
        rounds in proptest::collection::vec(0u64..=MAX_ROUND, 1..12),
        lock_mask in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let mut rounds = rounds;
        rounds.sort_unstable();
        let mut st = RoundState::new();
        let v = Hash32([7u8; 32]);
        for (i, r) in rounds.iter().enumerate() {
            st.start_round(*r);
            st.set_valid(v, *r);
            if lock_mask[i % lock_mask.len()] {
                st.lock(v, *r);
            }
            prop_assert_eq!(st.locked_round.is_some(), st.locked_value.is_some());
            if let (Some(lr), Some(vr)) = (st.locked_round, st.valid_round) {
                prop_assert!(vr >= lr);
            }
        }
    }
}
