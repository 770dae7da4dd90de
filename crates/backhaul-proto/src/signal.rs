//! Control-channel signals.
//!
//! The control channel speaks single ASCII bytes: `0` is a heartbeat, `1`
//! asks the client to open a new tunnel connection. Anything else is a
//! protocol fault and tears the instance down.

use thiserror::Error;

/// A control-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Liveness beacon, emitted by the server on the configured cadence.
    Heartbeat,
    /// Ask the peer to open a new tunnel connection.
    NewStream,
}

/// Raised for any control message that is not a known signal byte.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unexpected control message: {0:?}")]
pub struct SignalError(pub Vec<u8>);

impl Signal {
    /// The byte this signal puts on the wire.
    pub const fn as_byte(self) -> u8 {
        match self {
            Signal::Heartbeat => b'0',
            Signal::NewStream => b'1',
        }
    }

    /// A message is valid only when it is exactly one known byte.
    pub fn from_message(msg: &[u8]) -> Result<Self, SignalError> {
        match msg {
            b"0" => Ok(Signal::Heartbeat),
            b"1" => Ok(Signal::NewStream),
            other => Err(SignalError(other.to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signals_round_trip() {
        for signal in [Signal::Heartbeat, Signal::NewStream] {
            let byte = signal.as_byte();
            assert_eq!(Signal::from_message(&[byte]), Ok(signal));
        }
    }

    #[test]
    fn unknown_byte_is_a_fault() {
        assert!(Signal::from_message(b"2").is_err());
        assert!(Signal::from_message(b"").is_err());
    }

    #[test]
    fn multi_byte_message_is_a_fault() {
        // "01" contains two valid bytes but is not a single signal
        assert!(Signal::from_message(b"01").is_err());
    }
}
