//! Wire framing

pub mod codec;

pub use codec::{MessageCodec, MAX_FRAME_SIZE};
