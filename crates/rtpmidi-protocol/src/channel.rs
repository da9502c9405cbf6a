/// Channel identifiers: the routing key for every MIDI event this backend
/// exposes.
///
/// Textual form: `ch<N>.<type>[<control>]` (or `channel<N>. ...`), e.g.
/// `ch0.note60`, `channel15.cc7`, `ch3.pitch`.
///
/// Packed form (`label()`), 64 bits:
///   bits  0..8   control number (7 significant bits)
///   bits  8..16  MIDI channel (4 significant bits)
///   bits 16..24  control type tag (the MIDI status nibble, never zero)
///   bits 24..64  zero
///
/// Because the type tag is never zero, no valid identifier packs to zero and
/// zero stays free to mean "unset".

use std::fmt;
use std::str::FromStr;

use crate::error::ChannelError;

pub const MAX_CHANNEL: u8 = 15;
pub const MAX_CONTROL: u8 = 127;

const PITCH_BEND_MAX: f64 = 16383.0;
const DATA_MAX: f64 = 127.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlType {
    Note = 0x90,
    Pressure = 0xA0,
    Cc = 0xB0,
    Aftertouch = 0xD0,
    PitchBend = 0xE0,
}

// Matched in this order against the text after the `.`
const KEYWORDS: [(&str, ControlType); 5] = [
    ("cc", ControlType::Cc),
    ("note", ControlType::Note),
    ("pressure", ControlType::Pressure),
    ("pitch", ControlType::PitchBend),
    ("aftertouch", ControlType::Aftertouch),
];

impl ControlType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x90 => Some(Self::Note),
            0xA0 => Some(Self::Pressure),
            0xB0 => Some(Self::Cc),
            0xD0 => Some(Self::Aftertouch),
            0xE0 => Some(Self::PitchBend),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Cc => "cc",
            Self::Note => "note",
            Self::Pressure => "pressure",
            Self::PitchBend => "pitch",
            Self::Aftertouch => "aftertouch",
        }
    }

    /// Whether the channel spec carries a control number for this type.
    pub fn has_control_number(self) -> bool {
        matches!(self, Self::Cc | Self::Note | Self::Pressure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelIdent {
    channel: u8,
    kind: ControlType,
    control: u8,
}

impl ChannelIdent {
    /// Build an identifier from its fields. The control number is forced to
    /// zero for types that do not carry one.
    pub fn new(channel: u8, kind: ControlType, control: u8) -> Result<Self, ChannelError> {
        if channel > MAX_CHANNEL || control > MAX_CONTROL {
            return Err(ChannelError::InvalidIdentifier(pack(channel, kind, control)));
        }
        let control = if kind.has_control_number() { control } else { 0 };
        Ok(Self { channel, kind, control })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn kind(&self) -> ControlType {
        self.kind
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    /// Parse a textual channel specification.
    pub fn parse(spec: &str) -> Result<Self, ChannelError> {
        let malformed = |reason| ChannelError::MalformedSpec {
            spec: spec.to_string(),
            reason,
        };

        let rest = spec
            .strip_prefix("channel")
            .or_else(|| spec.strip_prefix("ch"))
            .ok_or_else(|| malformed("missing `ch` or `channel` prefix"))?;

        let (digits, rest) = split_digits(rest);
        if digits.is_empty() {
            return Err(malformed("missing channel number"));
        }
        let channel = digits
            .parse::<u8>()
            .ok()
            .filter(|&c| c <= MAX_CHANNEL)
            .ok_or_else(|| malformed("channel out of range (0-15)"))?;

        let rest = rest
            .strip_prefix('.')
            .ok_or_else(|| malformed("expected `.` after the channel number"))?;

        let (kind, rest) = KEYWORDS
            .iter()
            .find_map(|(keyword, kind)| rest.strip_prefix(keyword).map(|r| (*kind, r)))
            .ok_or_else(|| malformed("unknown control type"))?;

        let (digits, rest) = split_digits(rest);
        if !rest.is_empty() {
            return Err(malformed("trailing characters after the control"));
        }

        let control = if kind.has_control_number() {
            if digits.is_empty() {
                return Err(malformed("missing control number"));
            }
            digits
                .parse::<u8>()
                .ok()
                .filter(|&c| c <= MAX_CONTROL)
                .ok_or_else(|| malformed("control number out of range (0-127)"))?
        } else {
            0
        };

        Ok(Self { channel, kind, control })
    }

    /// Packed 64-bit routing key.
    pub fn label(&self) -> u64 {
        pack(self.channel, self.kind, self.control)
    }

    /// Validate and unpack a 64-bit routing key.
    pub fn from_label(label: u64) -> Result<Self, ChannelError> {
        let invalid = || ChannelError::InvalidIdentifier(label);

        if label >> 24 != 0 {
            return Err(invalid());
        }
        let control = (label & 0xFF) as u8;
        let channel = ((label >> 8) & 0xFF) as u8;
        let kind = ControlType::from_u8(((label >> 16) & 0xFF) as u8).ok_or_else(invalid)?;

        if channel > MAX_CHANNEL || control > MAX_CONTROL {
            return Err(invalid());
        }
        if !kind.has_control_number() && control != 0 {
            return Err(invalid());
        }
        Ok(Self { channel, kind, control })
    }

    /// Build the MIDI message that sets this channel to `value` (0.0-1.0).
    /// A note set to zero is sent as Note Off.
    pub fn to_midi(&self, value: f64) -> Vec<u8> {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        let data = (value * DATA_MAX).round() as u8;
        let ch = self.channel;

        match self.kind {
            ControlType::Note if data == 0 => vec![0x80 | ch, self.control, 0],
            ControlType::Note | ControlType::Pressure | ControlType::Cc => {
                vec![self.kind as u8 | ch, self.control, data]
            }
            ControlType::Aftertouch => vec![0xD0 | ch, data],
            ControlType::PitchBend => {
                let bend = (value * PITCH_BEND_MAX).round() as u16;
                vec![0xE0 | ch, (bend & 0x7F) as u8, (bend >> 7) as u8]
            }
        }
    }

    /// Map an inbound MIDI message to the channel it addresses and its
    /// normalized value. Returns `None` for messages that do not map to a
    /// channel (program change, system messages, truncated data).
    pub fn from_midi(data: &[u8]) -> Option<(Self, f64)> {
        let status = *data.first()?;
        if status < 0x80 || status >= 0xF0 {
            return None;
        }
        let channel = status & 0x0F;
        let byte = |i: usize| data.get(i).map(|b| b & 0x7F);

        let (kind, control, value) = match status & 0xF0 {
            0x80 => {
                byte(2)?;
                (ControlType::Note, byte(1)?, 0.0)
            }
            0x90 => (ControlType::Note, byte(1)?, byte(2)? as f64 / DATA_MAX),
            0xA0 => (ControlType::Pressure, byte(1)?, byte(2)? as f64 / DATA_MAX),
            0xB0 => (ControlType::Cc, byte(1)?, byte(2)? as f64 / DATA_MAX),
            0xD0 => (ControlType::Aftertouch, 0, byte(1)? as f64 / DATA_MAX),
            0xE0 => {
                let bend = ((byte(2)? as u16) << 7) | byte(1)? as u16;
                (ControlType::PitchBend, 0, bend as f64 / PITCH_BEND_MAX)
            }
            _ => return None,
        };

        Some((Self { channel, kind, control }, value))
    }
}

impl fmt::Display for ChannelIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}.{}", self.channel, self.kind.keyword())?;
        if self.kind.has_control_number() {
            write!(f, "{}", self.control)?;
        }
        Ok(())
    }
}

impl FromStr for ChannelIdent {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn pack(channel: u8, kind: ControlType, control: u8) -> u64 {
    ((kind as u64) << 16) | ((channel as u64) << 8) | control as u64
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed(spec: &str) -> bool {
        matches!(
            ChannelIdent::parse(spec),
            Err(ChannelError::MalformedSpec { .. })
        )
    }

    #[test]
    fn test_parse_long_and_short_prefix() {
        let long = ChannelIdent::parse("channel0.note60").unwrap();
        let short = ChannelIdent::parse("ch0.note60").unwrap();
        assert_eq!(long, short);
        assert_eq!(long.channel(), 0);
        assert_eq!(long.kind(), ControlType::Note);
        assert_eq!(long.control(), 60);
    }

    #[test]
    fn test_parse_every_control_type() {
        assert_eq!(ChannelIdent::parse("ch1.cc7").unwrap().kind(), ControlType::Cc);
        assert_eq!(
            ChannelIdent::parse("ch1.pressure64").unwrap().kind(),
            ControlType::Pressure
        );
        assert_eq!(
            ChannelIdent::parse("ch1.pitch").unwrap().kind(),
            ControlType::PitchBend
        );
        assert_eq!(
            ChannelIdent::parse("ch1.aftertouch").unwrap().kind(),
            ControlType::Aftertouch
        );
    }

    #[test]
    fn test_pitch_ignores_control_number() {
        let ident = ChannelIdent::parse("ch2.pitch5").unwrap();
        assert_eq!(ident.control(), 0);
        assert_eq!(ident.to_string(), "ch2.pitch");
    }

    #[test]
    fn test_reject_malformed_specs() {
        assert!(malformed("foo0.cc1"));
        assert!(malformed("ch16.cc1"));
        assert!(malformed("ch300.cc1"));
        assert!(malformed("ch.cc1"));
        assert!(malformed("ch1cc1"));
        assert!(malformed("ch1.cc"));
        assert!(malformed("ch1.cc128"));
        assert!(malformed("ch1.program3"));
        assert!(malformed("ch1.note60x"));
        assert!(malformed(""));
    }

    #[test]
    fn test_format_roundtrip() {
        for spec in ["ch0.cc0", "ch15.note127", "ch9.pressure3", "ch4.pitch", "ch7.aftertouch"] {
            assert_eq!(ChannelIdent::parse(spec).unwrap().to_string(), spec);
        }
    }

    #[test]
    fn test_label_layout() {
        let ident = ChannelIdent::parse("ch3.cc7").unwrap();
        assert_eq!(ident.label(), 0x00B0_0307);
        assert_eq!(ChannelIdent::from_label(0x00B0_0307).unwrap(), ident);
    }

    #[test]
    fn test_zero_label_is_invalid() {
        assert_eq!(
            ChannelIdent::from_label(0),
            Err(ChannelError::InvalidIdentifier(0))
        );
        // Channel 0, cc 0 still packs to a non-zero key
        assert_ne!(ChannelIdent::parse("ch0.cc0").unwrap().label(), 0);
    }

    #[test]
    fn test_from_label_rejects_bad_fields() {
        assert!(ChannelIdent::from_label(0x0100_B000_0000).is_err()); // reserved bits
        assert!(ChannelIdent::from_label(0x00C0_0000).is_err()); // program change tag
        assert!(ChannelIdent::from_label(0x00B0_1000).is_err()); // channel 16
        assert!(ChannelIdent::from_label(0x00B0_0080).is_err()); // control 128
        assert!(ChannelIdent::from_label(0x00E0_0001).is_err()); // pitch with control
    }

    #[test]
    fn test_to_midi_scaling() {
        let note = ChannelIdent::parse("ch0.note60").unwrap();
        assert_eq!(note.to_midi(1.0), vec![0x90, 60, 127]);
        assert_eq!(note.to_midi(0.0), vec![0x80, 60, 0]);

        let cc = ChannelIdent::parse("ch5.cc1").unwrap();
        assert_eq!(cc.to_midi(0.5), vec![0xB5, 1, 64]);
        assert_eq!(cc.to_midi(4.0), vec![0xB5, 1, 127]);

        let bend = ChannelIdent::parse("ch0.pitch").unwrap();
        assert_eq!(bend.to_midi(1.0), vec![0xE0, 0x7F, 0x7F]);
        assert_eq!(bend.to_midi(0.0), vec![0xE0, 0, 0]);

        let at = ChannelIdent::parse("ch2.aftertouch").unwrap();
        assert_eq!(at.to_midi(1.0), vec![0xD2, 127]);
    }

    #[test]
    fn test_from_midi() {
        let (ident, value) = ChannelIdent::from_midi(&[0x93, 64, 127]).unwrap();
        assert_eq!(ident.to_string(), "ch3.note64");
        assert_eq!(value, 1.0);

        let (ident, value) = ChannelIdent::from_midi(&[0x83, 64, 100]).unwrap();
        assert_eq!(ident.to_string(), "ch3.note64");
        assert_eq!(value, 0.0);

        let (ident, value) = ChannelIdent::from_midi(&[0xE1, 0x7F, 0x7F]).unwrap();
        assert_eq!(ident.to_string(), "ch1.pitch");
        assert_eq!(value, 1.0);

        assert!(ChannelIdent::from_midi(&[0xC0, 5]).is_none());
        assert!(ChannelIdent::from_midi(&[0xF8]).is_none());
        assert!(ChannelIdent::from_midi(&[0x90, 60]).is_none());
        assert!(ChannelIdent::from_midi(&[]).is_none());
    }
}
