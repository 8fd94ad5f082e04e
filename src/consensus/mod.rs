pub mod backend;
pub mod codec;
pub mod committee;
pub mod engine;
pub mod events;
pub mod messages;
pub mod msg_cache;
pub mod msg_store;
pub mod round_state;
pub mod sign_guard;
pub mod timeouts;

pub use backend::*;
pub use codec::{decode_msg, encode_msg, CodecError};
pub use committee::*;
pub use engine::*;
pub use events::*;
pub use messages::*;
pub use msg_cache::{CacheError, MsgCache, Validity};
pub use msg_store::MsgStore;
pub use round_state::*;
pub use sign_guard::{GuardError, SignGuard};
pub use timeouts::{timeout_duration, TimeoutScheduler};
