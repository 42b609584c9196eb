//! Text protocol spoken by the controller boxes: message types, the streaming
//! decoder, and the handler table that dispatches decoded messages.

pub mod codec;
pub mod interpreter;
pub mod messages;

pub use codec::{decode_all, decode_frame, decode_next, DecodeError, DecodedBatch, FrameBuffer};
pub use interpreter::ResponseInterpreter;
pub use messages::*;
