use crate::error::PacketError;
use crate::{RTP_MIDI_PAYLOAD_TYPE, RTP_VERSION};

// -- RTP-MIDI data packet (RFC 6295) --
//
//  0                   1                   2                   3
// |V=2|P|X|  CC   |M|     PT      |        Sequence number        |
// |                           Timestamp                           |
// |                             SSRC                              |
// |B|J|Z|P|  LEN  |  LEN (B=1)    |  MIDI list ...
//
// The MIDI list is a sequence of [delta time] [command] pairs. The first
// command only carries a delta time when Z is set; this codec always sets Z
// and always writes explicit status bytes.

const FLAG_LONG_HEADER: u8 = 0x80;
const FLAG_FIRST_DELTA: u8 = 0x20;

/// Largest delta time a 4-byte variable-length quantity can carry
pub const MAX_DELTA_TIME: u32 = 0x0FFF_FFFF;

/// A single MIDI command with its delta time (in RTP timestamp ticks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiCommand {
    pub delta: u32,
    pub data: Vec<u8>,
}

impl MidiCommand {
    pub fn new(delta: u32, data: Vec<u8>) -> Self {
        Self { delta, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMidiPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub commands: Vec<MidiCommand>,
}

impl RtpMidiPacket {
    /// Fixed RTP header: flags(1) + PT(1) + seq(2) + timestamp(4) + ssrc(4) = 12
    pub const HEADER_SIZE: usize = 12;
    /// 12-bit LEN field
    pub const MAX_COMMAND_SECTION: usize = 0x0FFF;

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), PacketError> {
        let mut list = Vec::with_capacity(self.commands.len() * 4);
        for command in &self.commands {
            validate_command(&command.data)?;
            encode_delta(command.delta, &mut list)?;
            list.extend_from_slice(&command.data);
        }

        if list.len() > Self::MAX_COMMAND_SECTION {
            return Err(PacketError::CommandSectionTooLarge(list.len()));
        }

        buf.clear();
        buf.push(RTP_VERSION << 6);
        let marker: u8 = if list.is_empty() { 0x00 } else { 0x80 };
        buf.push(marker | RTP_MIDI_PAYLOAD_TYPE);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());

        let len = list.len();
        let z = if list.is_empty() { 0 } else { FLAG_FIRST_DELTA };
        if len > 0x0F {
            buf.push(FLAG_LONG_HEADER | z | ((len >> 8) as u8 & 0x0F));
            buf.push((len & 0xFF) as u8);
        } else {
            buf.push(z | len as u8);
        }
        buf.extend_from_slice(&list);

        Ok(())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(PacketError::MalformedPacket("short RTP header"));
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(PacketError::MalformedPacket("unsupported RTP version"));
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = Self::HEADER_SIZE + csrc_count * 4;
        if extension {
            if data.len() < offset + 4 {
                return Err(PacketError::MalformedPacket("truncated header extension"));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(PacketError::MalformedPacket("invalid RTP padding"));
            }
            end -= pad;
        }

        if offset >= end {
            return Err(PacketError::MalformedPacket("missing MIDI command section"));
        }

        let flags = data[offset];
        let mut len = (flags & 0x0F) as usize;
        offset += 1;
        if flags & FLAG_LONG_HEADER != 0 {
            if offset >= end {
                return Err(PacketError::MalformedPacket("truncated command section header"));
            }
            len = (len << 8) | data[offset] as usize;
            offset += 1;
        }

        if offset + len > end {
            return Err(PacketError::MalformedPacket("truncated MIDI command section"));
        }

        // Bytes after the command list belong to the recovery journal (J flag),
        // which is not interpreted.
        let commands = decode_command_list(
            &data[offset..offset + len],
            flags & FLAG_FIRST_DELTA != 0,
        )?;

        Ok(Self {
            sequence,
            timestamp,
            ssrc,
            commands,
        })
    }
}

/// Write a delta time as a 1-4 byte MIDI variable-length quantity.
pub fn encode_delta(value: u32, buf: &mut Vec<u8>) -> Result<(), PacketError> {
    if value > MAX_DELTA_TIME {
        return Err(PacketError::DeltaTimeOverflow(value));
    }

    let mut groups = [0u8; 4];
    let mut count = 0;
    let mut rest = value;
    loop {
        groups[count] = (rest & 0x7F) as u8;
        count += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }

    for i in (0..count).rev() {
        let continuation = if i > 0 { 0x80 } else { 0x00 };
        buf.push(groups[i] | continuation);
    }
    Ok(())
}

/// Read a 1-4 byte variable-length quantity, returning (value, bytes consumed).
pub fn decode_delta(data: &[u8]) -> Result<(u32, usize), PacketError> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().take(4).enumerate() {
        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    if data.len() < 4 {
        Err(PacketError::MalformedPacket("truncated delta time"))
    } else {
        Err(PacketError::MalformedPacket("delta time longer than 4 bytes"))
    }
}

/// Number of data bytes following a status byte, or `None` for SysEx,
/// whose length is delimited by its end marker.
fn data_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(2),
        0xC0..=0xDF => Some(1),
        0xF0 | 0xF7 => None,
        0xF1 | 0xF3 => Some(1),
        0xF2 => Some(2),
        // Tune request, undefined system common, realtime
        _ => Some(0),
    }
}

/// SysEx segments end with F7 (complete), F0 (continued) or F4 (cancelled).
fn is_sysex_end(byte: u8) -> bool {
    matches!(byte, 0xF7 | 0xF0 | 0xF4)
}

fn validate_command(data: &[u8]) -> Result<(), PacketError> {
    let (&status, body) = data
        .split_first()
        .ok_or(PacketError::InvalidCommand("empty command"))?;
    if status & 0x80 == 0 {
        return Err(PacketError::InvalidCommand("missing status byte"));
    }

    match data_len(status) {
        Some(n) => {
            if body.len() != n {
                return Err(PacketError::InvalidCommand("wrong data length for status"));
            }
            if body.iter().any(|b| b & 0x80 != 0) {
                return Err(PacketError::InvalidCommand("status byte inside data"));
            }
        }
        None => {
            let (&last, payload) = body
                .split_last()
                .ok_or(PacketError::InvalidCommand("SysEx without end marker"))?;
            if !is_sysex_end(last) || payload.iter().any(|b| b & 0x80 != 0) {
                return Err(PacketError::InvalidCommand("SysEx without end marker"));
            }
        }
    }
    Ok(())
}

fn decode_command_list(list: &[u8], first_has_delta: bool) -> Result<Vec<MidiCommand>, PacketError> {
    let mut commands = Vec::new();
    let mut pos = 0;
    let mut running_status: Option<u8> = None;

    while pos < list.len() {
        let delta = if commands.is_empty() && !first_has_delta {
            0
        } else {
            let (delta, used) = decode_delta(&list[pos..])?;
            pos += used;
            delta
        };

        let Some(&lead) = list.get(pos) else {
            return Err(PacketError::MalformedPacket("delta time without command"));
        };

        let status = if lead & 0x80 != 0 {
            pos += 1;
            lead
        } else {
            running_status.ok_or(PacketError::MalformedPacket(
                "data byte without running status",
            ))?
        };

        let mut data = vec![status];
        match data_len(status) {
            Some(n) => {
                let body = list
                    .get(pos..pos + n)
                    .ok_or(PacketError::MalformedPacket("truncated MIDI command"))?;
                if body.iter().any(|b| b & 0x80 != 0) {
                    return Err(PacketError::MalformedPacket("truncated MIDI command"));
                }
                data.extend_from_slice(body);
                pos += n;
            }
            None => {
                // Opaque SysEx segment, kept whole including its end marker
                let end = list[pos..]
                    .iter()
                    .position(|&b| is_sysex_end(b))
                    .ok_or(PacketError::MalformedPacket("unterminated SysEx"))?;
                data.extend_from_slice(&list[pos..=pos + end]);
                pos += end + 1;
            }
        }

        match status {
            0x80..=0xEF => running_status = Some(status),
            // System common and SysEx cancel running status, realtime does not
            0xF0..=0xF7 => running_status = None,
            _ => {}
        }

        commands.push(MidiCommand { delta, data });
    }

    Ok(commands)
}
