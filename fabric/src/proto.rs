//! Control-message protocol and connection state machines
//!
//! Exactly two control messages cross a connection in its lifetime: the
//! host advertises its registered region once (MR), and the NIC may signal
//! orderly shutdown (DONE). Messages are bincode-encoded into a fixed-size
//! buffer so both sides can pre-register a single receive slot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed size of the registered control-message buffers. Large enough for
/// every variant; the remainder is NUL padding on the wire.
pub const CTRL_MSG_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control message exceeds {CTRL_MSG_SIZE}-byte buffer")]
    Oversize,

    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("unexpected control message: {0}")]
    Unexpected(&'static str),

    #[error("invalid {kind} transition from {from} on {event}")]
    InvalidTransition {
        kind: &'static str,
        from: &'static str,
        event: &'static str,
    },
}

/// Remote region advertisement: everything the NIC needs to post one-sided
/// READs against the host's shared segment. `lkey` is carried for wire
/// parity with the region descriptor but never used by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub addr: u64,
    pub length: u64,
    pub rkey: u32,
    pub lkey: u32,
}

/// Tagged control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Mr(RegionDescriptor),
    Done,
}

impl ControlMessage {
    /// Encode into a pre-registered buffer of at least `CTRL_MSG_SIZE`
    /// bytes. Unused trailing bytes are zeroed.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let bytes = bincode::serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if bytes.len() > CTRL_MSG_SIZE || buf.len() < CTRL_MSG_SIZE {
            return Err(ProtocolError::Oversize);
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        buf[bytes.len()..CTRL_MSG_SIZE].fill(0);
        Ok(())
    }

    /// Decode from a received control buffer; trailing padding is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(buf).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Mr(_) => "MR",
            Self::Done => "DONE",
        }
    }

    /// The region advertisement, or an `Unexpected` protocol error for any
    /// other tag (the receiver must then terminate the connection).
    pub fn expect_mr(self) -> Result<RegionDescriptor, ProtocolError> {
        match self {
            Self::Mr(desc) => Ok(desc),
            other => Err(ProtocolError::Unexpected(other.name())),
        }
    }

    /// The shutdown signal, or an `Unexpected` protocol error.
    pub fn expect_done(self) -> Result<(), ProtocolError> {
        match self {
            Self::Done => Ok(()),
            other => Err(ProtocolError::Unexpected(other.name())),
        }
    }
}

/// Send-side progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init,
    MrSent,
    RdmaSent,
    DoneSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendEvent {
    MrSendCompleted,
    ReadBatchCompleted,
    DoneSendCompleted,
}

impl SendState {
    /// Explicit transition function; an invalid pair fails the connection
    /// rather than silently advancing.
    pub fn advance(self, event: SendEvent) -> Result<Self, ProtocolError> {
        use SendEvent::*;
        use SendState::*;
        match (self, event) {
            (Init, MrSendCompleted) => Ok(MrSent),
            // READ batches repeat for the lifetime of the connection; the
            // NIC side issues them without ever having sent an MR.
            (Init | MrSent | RdmaSent, ReadBatchCompleted) => Ok(RdmaSent),
            (MrSent | RdmaSent, DoneSendCompleted) => Ok(DoneSent),
            (from, event) => Err(ProtocolError::InvalidTransition {
                kind: "send",
                from: from.name(),
                event: event.name(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::MrSent => "MR_SENT",
            Self::RdmaSent => "RDMA_SENT",
            Self::DoneSent => "DONE_SENT",
        }
    }
}

/// Receive-side progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Init,
    MrReceived,
    DoneReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvEvent {
    MrReceived,
    DoneReceived,
}

impl RecvState {
    pub fn advance(self, event: RecvEvent) -> Result<Self, ProtocolError> {
        match (self, event) {
            (Self::Init, RecvEvent::MrReceived) => Ok(Self::MrReceived),
            (Self::Init | Self::MrReceived, RecvEvent::DoneReceived) => Ok(Self::DoneReceived),
            (from, event) => Err(ProtocolError::InvalidTransition {
                kind: "recv",
                from: from.name(),
                event: event.name(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::MrReceived => "MR_RECV",
            Self::DoneReceived => "DONE_RECV",
        }
    }
}

impl SendEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::MrSendCompleted => "MR send completion",
            Self::ReadBatchCompleted => "READ completion",
            Self::DoneSendCompleted => "DONE send completion",
        }
    }
}

impl RecvEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::MrReceived => "MR",
            Self::DoneReceived => "DONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mr_message_fits_fixed_buffer() {
        let msg = ControlMessage::Mr(RegionDescriptor {
            addr: 0x7f00_dead_0000,
            length: 4096,
            rkey: 0x1234_5678,
            lkey: 0x9abc_def0,
        });

        let mut buf = [0xffu8; CTRL_MSG_SIZE];
        msg.encode_into(&mut buf).unwrap();

        let decoded = ControlMessage::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.expect_mr().unwrap().rkey, 0x1234_5678);
    }

    #[test]
    fn done_message_round_trip() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        ControlMessage::Done.encode_into(&mut buf).unwrap();

        let decoded = ControlMessage::decode(&buf).unwrap();
        assert_eq!(decoded, ControlMessage::Done);
        assert!(decoded.expect_mr().is_err());
    }

    #[test]
    fn garbage_tag_is_malformed() {
        let buf = [0xabu8; CTRL_MSG_SIZE];
        assert!(matches!(
            ControlMessage::decode(&buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn undersized_buffer_rejected() {
        let mut buf = [0u8; 8];
        assert!(matches!(
            ControlMessage::Done.encode_into(&mut buf),
            Err(ProtocolError::Oversize)
        ));
    }

    #[test]
    fn send_state_walk() {
        let s = SendState::Init;
        let s = s.advance(SendEvent::MrSendCompleted).unwrap();
        assert_eq!(s, SendState::MrSent);
        let s = s.advance(SendEvent::DoneSendCompleted).unwrap();
        assert_eq!(s, SendState::DoneSent);

        // A READ batch on the NIC side starts from INIT.
        assert_eq!(
            SendState::Init.advance(SendEvent::ReadBatchCompleted).unwrap(),
            SendState::RdmaSent
        );
        // Terminal state accepts nothing further.
        assert!(SendState::DoneSent.advance(SendEvent::MrSendCompleted).is_err());
    }

    #[test]
    fn recv_state_rejects_duplicate_mr() {
        let s = RecvState::Init.advance(RecvEvent::MrReceived).unwrap();
        assert_eq!(s, RecvState::MrReceived);
        assert!(s.advance(RecvEvent::MrReceived).is_err());
        assert_eq!(
            s.advance(RecvEvent::DoneReceived).unwrap(),
            RecvState::DoneReceived
        );
    }
}
