//! Error types for the RTP-MIDI codecs

use thiserror::Error;

/// Channel specification and identifier errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel specification text does not follow `ch<N>.<type>[<control>]`
    #[error("malformed channel spec {spec:?}: {reason}")]
    MalformedSpec { spec: String, reason: &'static str },

    /// Packed identifier that does not describe a valid channel
    #[error("invalid channel identifier 0x{0:016x}")]
    InvalidIdentifier(u64),
}

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Inbound bytes that cannot be decoded
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Delta time outside the 4-byte variable-length range
    #[error("delta time {0} exceeds 0x0fffffff")]
    DeltaTimeOverflow(u32),

    /// MIDI command list longer than the 12-bit length field allows
    #[error("command section too large: {0} bytes (max 4095)")]
    CommandSectionTooLarge(usize),

    /// Outbound command that is not a complete MIDI message
    #[error("invalid MIDI command: {0}")]
    InvalidCommand(&'static str),
}
