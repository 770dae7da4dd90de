//! Wire protocol for the backhaul reverse tunnel.
//!
//! Three small pieces shared by both peers: the single-byte control-channel
//! signals, the length-prefixed framing used for the token handshake and
//! TCP-variant control messages, and the public-port mapping grammar.

pub mod frame;
pub mod portmap;
pub mod signal;

pub use frame::{read_frame, read_port, write_frame, write_port, FrameError, MAX_FRAME_LEN};
pub use portmap::{parse_mappings, PortMapError, PortMapping};
pub use signal::{Signal, SignalError};

/// Reply payload confirming a token handshake.
pub const AUTH_OK: &[u8] = b"ok";
/// Reply payload rejecting a token handshake.
pub const AUTH_ERROR: &[u8] = b"error";
