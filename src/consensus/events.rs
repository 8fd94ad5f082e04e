use crate::consensus::round_state::Step;
use crate::types::{Address, Block, Height, Round};

/// Posted onto the main event channel when a step timer expires. The engine
/// drops it unless the (height, round) still matches the current view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub step: Step,
    pub height: Height,
    pub round: Round,
}

/// Everything the core event loop reacts to. One event is processed at a
/// time; producers are the network decode thread, the timer tasks, the
/// execution collaborator and the engine itself (buffered-height replays).
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// Raw consensus payload from the network (or replayed from the store).
    Message { payload: Vec<u8> },
    /// A fresh local candidate block became available for proposing.
    NewUnminedBlock(Block),
    /// The execution collaborator finished applying the committed block.
    Commit,
    /// A peer asked to be synced.
    Sync { addr: Address },
    Timeout(TimeoutEvent),
}
