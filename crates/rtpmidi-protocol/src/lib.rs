pub mod apple;
pub mod channel;
pub mod error;
pub mod packets;

pub use error::{ChannelError, PacketError};

/// AppleMIDI session protocol version carried in every exchange packet
pub const APPLEMIDI_PROTOCOL_VERSION: u32 = 2;

/// mDNS service type advertised by RTP-MIDI session endpoints
pub const MDNS_SERVICE_TYPE: &str = "_apple-midi._udp.local.";

/// RTP version field value
pub const RTP_VERSION: u8 = 2;

/// Dynamic RTP payload type used for the MIDI command section
pub const RTP_MIDI_PAYLOAD_TYPE: u8 = 97;

/// Default ports
pub const DEFAULT_MDNS_PORT: u16 = 5353;
pub const DEFAULT_PEER_PORT: u16 = 5004;

/// AppleMIDI timestamps and RTP-MIDI timestamps tick in 100 microsecond units
pub const CLOCK_RATE_HZ: u64 = 10_000;
