/// AppleMIDI session control packets.
///
/// Every control packet starts with the signature `FF FF` followed by a
/// two-letter command. Exchange packets (`IN`, `OK`, `NO`, `BY`) travel on
/// the control port for the first handshake and on the data port for the
/// second; `CK` (clock sync) and `RS` (receiver feedback) travel on the data
/// port next to the RTP-MIDI stream.

use crate::error::PacketError;
use crate::APPLEMIDI_PROTOCOL_VERSION;

pub const SIGNATURE: [u8; 2] = [0xFF, 0xFF];

pub const CMD_INVITATION: [u8; 2] = *b"IN";
pub const CMD_ACCEPTED: [u8; 2] = *b"OK";
pub const CMD_REJECTED: [u8; 2] = *b"NO";
pub const CMD_END: [u8; 2] = *b"BY";
pub const CMD_SYNC: [u8; 2] = *b"CK";
pub const CMD_FEEDBACK: [u8; 2] = *b"RS";

/// Payload shared by invitation, acceptance, rejection and end packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub version: u32,
    /// Initiator token, chosen by the inviting side and echoed in the reply
    pub token: u32,
    /// SSRC of the sender
    pub ssrc: u32,
    pub name: Option<String>,
}

impl Exchange {
    pub fn new(token: u32, ssrc: u32, name: Option<String>) -> Self {
        Self {
            version: APPLEMIDI_PROTOCOL_VERSION,
            token,
            ssrc,
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Invitation(Exchange),
    Accepted(Exchange),
    Rejected(Exchange),
    End(Exchange),
    Sync {
        ssrc: u32,
        count: u8,
        timestamps: [u64; 3],
    },
    Feedback {
        ssrc: u32,
        sequence: u16,
    },
}

impl ControlPacket {
    /// signature(2) + command(2) + version(4) + token(4) + ssrc(4) = 16
    pub const EXCHANGE_SIZE: usize = 16;
    /// signature(2) + command(2) + ssrc(4) + count(1) + padding(3) + 3 * timestamp(8) = 36
    pub const SYNC_SIZE: usize = 36;
    /// signature(2) + command(2) + ssrc(4) + sequence(2) + padding(2) = 12
    pub const FEEDBACK_SIZE: usize = 12;

    /// Whether a datagram carries an AppleMIDI control packet rather than
    /// RTP-MIDI. RTP version 2 packets can never start with `FF FF`.
    pub fn is_control(data: &[u8]) -> bool {
        data.len() >= 4 && data[0..2] == SIGNATURE
    }

    /// SSRC of the sending endpoint.
    pub fn ssrc(&self) -> u32 {
        match self {
            Self::Invitation(ex) | Self::Accepted(ex) | Self::Rejected(ex) | Self::End(ex) => {
                ex.ssrc
            }
            Self::Sync { ssrc, .. } | Self::Feedback { ssrc, .. } => *ssrc,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&SIGNATURE);

        match self {
            Self::Invitation(ex) => write_exchange(buf, CMD_INVITATION, ex),
            Self::Accepted(ex) => write_exchange(buf, CMD_ACCEPTED, ex),
            Self::Rejected(ex) => write_exchange(buf, CMD_REJECTED, ex),
            Self::End(ex) => write_exchange(buf, CMD_END, ex),
            Self::Sync {
                ssrc,
                count,
                timestamps,
            } => {
                buf.extend_from_slice(&CMD_SYNC);
                buf.extend_from_slice(&ssrc.to_be_bytes());
                buf.push(*count);
                buf.extend_from_slice(&[0, 0, 0]);
                for ts in timestamps {
                    buf.extend_from_slice(&ts.to_be_bytes());
                }
            }
            Self::Feedback { ssrc, sequence } => {
                buf.extend_from_slice(&CMD_FEEDBACK);
                buf.extend_from_slice(&ssrc.to_be_bytes());
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.extend_from_slice(&[0, 0]);
            }
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if !Self::is_control(data) {
            return Err(PacketError::MalformedPacket("missing AppleMIDI signature"));
        }

        let command = [data[2], data[3]];
        match command {
            CMD_INVITATION => Ok(Self::Invitation(read_exchange(data)?)),
            CMD_ACCEPTED => Ok(Self::Accepted(read_exchange(data)?)),
            CMD_REJECTED => Ok(Self::Rejected(read_exchange(data)?)),
            CMD_END => Ok(Self::End(read_exchange(data)?)),
            CMD_SYNC => {
                if data.len() < Self::SYNC_SIZE {
                    return Err(PacketError::MalformedPacket("short sync packet"));
                }
                let count = data[8];
                if count > 2 {
                    return Err(PacketError::MalformedPacket("sync count out of range"));
                }
                let mut timestamps = [0u64; 3];
                for (i, ts) in timestamps.iter_mut().enumerate() {
                    let at = 12 + i * 8;
                    *ts = read_u64(&data[at..at + 8]);
                }
                Ok(Self::Sync {
                    ssrc: read_u32(&data[4..8]),
                    count,
                    timestamps,
                })
            }
            CMD_FEEDBACK => {
                if data.len() < Self::FEEDBACK_SIZE - 2 {
                    return Err(PacketError::MalformedPacket("short feedback packet"));
                }
                Ok(Self::Feedback {
                    ssrc: read_u32(&data[4..8]),
                    sequence: u16::from_be_bytes([data[8], data[9]]),
                })
            }
            _ => Err(PacketError::MalformedPacket("unknown AppleMIDI command")),
        }
    }
}

fn write_exchange(buf: &mut Vec<u8>, command: [u8; 2], ex: &Exchange) {
    buf.extend_from_slice(&command);
    buf.extend_from_slice(&ex.version.to_be_bytes());
    buf.extend_from_slice(&ex.token.to_be_bytes());
    buf.extend_from_slice(&ex.ssrc.to_be_bytes());
    if let Some(ref name) = ex.name {
        // NUL-terminated; embedded NULs would truncate the name on the wire
        buf.extend(name.bytes().take_while(|&b| b != 0));
        buf.push(0);
    }
}

fn read_exchange(data: &[u8]) -> Result<Exchange, PacketError> {
    if data.len() < ControlPacket::EXCHANGE_SIZE {
        return Err(PacketError::MalformedPacket("short exchange packet"));
    }

    let tail = &data[ControlPacket::EXCHANGE_SIZE..];
    let name_bytes = match tail.iter().position(|&b| b == 0) {
        Some(end) => &tail[..end],
        None => tail,
    };
    let name = if name_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(name_bytes).to_string())
    };

    Ok(Exchange {
        version: read_u32(&data[4..8]),
        token: read_u32(&data[8..12]),
        ssrc: read_u32(&data[12..16]),
        name,
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
