//! Wire protocol shared by relay clients and servers.
//!
//! Every connection opens with a [`Preamble`] naming the exchange mode,
//! followed by length-prefixed frames. Client frames carry a [`Request`]; the
//! server answers each with an [`Acknowledgement`]. A zero-length client frame
//! marks the end of the stream.

mod codec;
mod envelope;
mod frame;

pub use codec::{CodecChain, CodecError, CodecKind, DecodeError};
pub use envelope::{Acknowledgement, Converted, Request, WireEvent, new_request_id};
pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, FrameError, FramePoll, FrameReader, MAGIC, Mode, Preamble, done_frame,
    encode_frame,
};
