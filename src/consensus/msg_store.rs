//! Height-indexed store of every validated consensus message.
//!
//! The accountability detector scans it after finalisation and the sync
//! service replays it to lagging peers, so it keeps everything it is given --
//! including messages that the state machine rejected as duplicates or
//! equivocations -- until the height leaves the accountability window.

use crate::consensus::messages::Message;
use crate::types::{Address, Height, Round};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type SenderMap = HashMap<Address, Vec<Arc<Message>>>;
type KindMap = HashMap<u8, SenderMap>;
type RoundMap = HashMap<Round, KindMap>;

#[derive(Default)]
struct StoreInner {
    /// Lowest height still buffered; 0 until the first save.
    first_height: Height,
    messages: HashMap<Height, RoundMap>,
}

/// Concurrent message index keyed by (height, round, kind, sender).
///
/// `save` and `delete_before` take the exclusive lock, `get` the shared one;
/// results are materialised before the lock is released and no caller code
/// runs under it.
#[derive(Default)]
pub struct MsgStore {
    inner: RwLock<StoreInner>,
}

impl MsgStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message. Byte-identical duplicates (same content hash from the
    /// same sender slot) are dropped, distinct payloads for the same slot are
    /// appended -- a second entry is what equivocation evidence looks like.
    pub fn save(&self, msg: Arc<Message>) {
        let mut inner = self.inner.write();
        // late past-height messages are retained too, so the floor can move
        // down as well as start
        if inner.first_height == 0 || msg.height() < inner.first_height {
            inner.first_height = msg.height();
        }
        let list = inner
            .messages
            .entry(msg.height())
            .or_default()
            .entry(msg.round())
            .or_default()
            .entry(msg.code())
            .or_default()
            .entry(msg.sender())
            .or_default();
        if list.iter().any(|m| m.hash() == msg.hash()) {
            return;
        }
        list.push(msg);
    }

    /// All messages at `height` satisfying `predicate`. Order is unspecified.
    pub fn get<F>(&self, height: Height, predicate: F) -> Vec<Arc<Message>>
    where
        F: Fn(&Message) -> bool,
    {
        let inner = self.inner.read();
        let mut result = Vec::new();
        let Some(rounds) = inner.messages.get(&height) else {
            return result;
        };
        for kinds in rounds.values() {
            for senders in kinds.values() {
                for msgs in senders.values() {
                    for m in msgs {
                        if predicate(m) {
                            result.push(Arc::clone(m));
                        }
                    }
                }
            }
        }
        result
    }

    pub fn first_height_buffered(&self) -> Height {
        self.inner.read().first_height
    }

    /// Drop every entry with height <= `height`.
    pub fn delete_before(&self, height: Height) {
        let mut inner = self.inner.write();
        inner.messages.retain(|h, _| *h > height);
        if inner.first_height <= height {
            inner.first_height = height.saturating_add(1);
        }
    }
}
