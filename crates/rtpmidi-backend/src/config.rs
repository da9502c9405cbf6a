//! Option parsing for the backend and its instances.
//!
//! The host hands options over as `name = value` strings. Instance options
//! are validated as they arrive; the instance mode gates which of them apply.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use rtpmidi_protocol::{DEFAULT_MDNS_PORT, DEFAULT_PEER_PORT};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Unconfigured,
    Direct,
    Apple,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfigured => "unconfigured",
            Self::Direct => "direct",
            Self::Apple => "apple",
        })
    }
}

// -- Instance configuration --

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub mode: Mode,
    /// Set once a mode-specific option has been applied
    mode_locked: bool,
    /// Local SSRC, 0 = random at start
    pub ssrc: u32,
    /// Local bind address. In apple mode this is the control port; data uses
    /// the next port up.
    pub bind: SocketAddr,
    /// Direct mode: add unknown senders and discovered peers
    pub learn: bool,
    /// Direct mode: statically configured peers (data ports)
    pub peers: Vec<SocketAddr>,
    /// Apple mode: advertised and offered session name
    pub session: Option<String>,
    /// Apple mode: who to invite
    pub invite: InviteList,
    /// Apple mode: whose invitations to accept
    pub join: AcceptFilter,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Unconfigured,
            mode_locked: false,
            ssrc: 0,
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            learn: false,
            peers: Vec::new(),
            session: None,
            invite: InviteList::default(),
            join: AcceptFilter::default(),
        }
    }
}

impl InstanceConfig {
    /// Apply one option. Repeatable options (`peer`, `invite`, `join`)
    /// accumulate.
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match option {
            "mode" => self.set_mode(value),
            "ssrc" => {
                self.ssrc = parse_ssrc(value).map_err(|r| ConfigError::invalid(option, value, r))?;
                Ok(())
            }
            "bind" => {
                self.bind = parse_host(value, 0).map_err(|r| ConfigError::invalid(option, value, r))?;
                Ok(())
            }
            "learn" => {
                self.require_mode(option, Mode::Direct)?;
                self.learn = value == "true";
                Ok(())
            }
            "peer" => {
                self.require_mode(option, Mode::Direct)?;
                let addr = parse_host(value, DEFAULT_PEER_PORT)
                    .map_err(|r| ConfigError::invalid(option, value, r))?;
                if !self.peers.contains(&addr) {
                    self.peers.push(addr);
                }
                Ok(())
            }
            "session" => {
                self.require_mode(option, Mode::Apple)?;
                if value.is_empty() {
                    return Err(ConfigError::invalid(option, value, "empty session name"));
                }
                self.session = Some(value.to_string());
                Ok(())
            }
            "invite" => {
                self.require_mode(option, Mode::Apple)?;
                self.invite
                    .extend(value)
                    .map_err(|r| ConfigError::invalid(option, value, r))
            }
            "join" => {
                self.require_mode(option, Mode::Apple)?;
                self.join.extend(value);
                Ok(())
            }
            _ => Err(ConfigError::UnknownOption(option.to_string())),
        }
    }

    /// Checks that need the complete option set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == Mode::Unconfigured {
            return Err(ConfigError::ModeNotSet("mode".to_string()));
        }
        Ok(())
    }

    fn set_mode(&mut self, value: &str) -> Result<(), ConfigError> {
        let requested = match value {
            "direct" => Mode::Direct,
            "apple" => Mode::Apple,
            _ => return Err(ConfigError::invalid("mode", value, "expected `direct` or `apple`")),
        };
        if self.mode_locked && requested != self.mode {
            return Err(ConfigError::ModeLocked {
                current: self.mode,
                requested,
            });
        }
        self.mode = requested;
        Ok(())
    }

    fn require_mode(&mut self, option: &str, mode: Mode) -> Result<(), ConfigError> {
        if self.mode == Mode::Unconfigured {
            return Err(ConfigError::ModeNotSet(option.to_string()));
        }
        if self.mode != mode {
            return Err(ConfigError::ModeMismatch {
                option: option.to_string(),
                mode: self.mode,
            });
        }
        self.mode_locked = true;
        Ok(())
    }
}

// -- Invite list and accept filter --

/// Apple-mode invitation targets. Endpoints are invited at start, names when
/// a matching advertisement is discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InviteList {
    pub all: bool,
    pub endpoints: Vec<SocketAddr>,
    pub names: Vec<String>,
}

impl InviteList {
    fn extend(&mut self, value: &str) -> Result<(), String> {
        for entry in split_list(value) {
            if entry == "*" {
                self.all = true;
            } else if is_endpoint(entry) {
                let addr = parse_host(entry, DEFAULT_PEER_PORT)?;
                if !self.endpoints.contains(&addr) {
                    self.endpoints.push(addr);
                }
            } else if !self.names.iter().any(|n| n == entry) {
                self.names.push(entry.to_string());
            }
        }
        Ok(())
    }

    /// Whether a discovered session with this name should be invited.
    pub fn matches_name(&self, name: &str) -> bool {
        self.all || self.names.iter().any(|n| n == name)
    }
}

/// Apple-mode invitation acceptance. An empty filter rejects everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptFilter {
    pub all: bool,
    pub names: Vec<String>,
    pub addresses: Vec<IpAddr>,
}

impl AcceptFilter {
    fn extend(&mut self, value: &str) {
        for entry in split_list(value) {
            if entry == "*" {
                self.all = true;
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                self.addresses.push(ip);
            } else {
                self.names.push(entry.to_string());
            }
        }
    }

    pub fn allows(&self, name: Option<&str>, ip: IpAddr) -> bool {
        self.all
            || self.addresses.contains(&ip)
            || name.is_some_and(|name| self.names.iter().any(|n| n == name))
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|e| !e.is_empty())
}

/// An invite entry names an endpoint when it is an IP literal or carries a
/// numeric port; anything else is a session name.
fn is_endpoint(entry: &str) -> bool {
    if entry.parse::<IpAddr>().is_ok() || entry.starts_with('[') {
        return true;
    }
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

// -- Global configuration --

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    /// Host name used when advertising apple-mode sessions
    pub mdns_name: Option<String>,
    /// Interface address for discovery traffic
    pub mdns_bind: Option<SocketAddr>,
    /// Log every inbound event with its channel spec
    pub detect: bool,
}

impl GlobalConfig {
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match option {
            "mdns-name" => {
                if self.mdns_name.is_some() {
                    return Err(ConfigError::Duplicate(option.to_string()));
                }
                if value.is_empty() {
                    return Err(ConfigError::invalid(option, value, "empty host name"));
                }
                self.mdns_name = Some(value.to_string());
            }
            "mdns-bind" => {
                if self.mdns_bind.is_some() {
                    return Err(ConfigError::Duplicate(option.to_string()));
                }
                let addr = parse_host(value, DEFAULT_MDNS_PORT)
                    .map_err(|r| ConfigError::invalid(option, value, r))?;
                self.mdns_bind = Some(addr);
            }
            "detect" => {
                self.detect = match value {
                    "on" => true,
                    "off" => false,
                    _ => return Err(ConfigError::invalid(option, value, "expected `on` or `off`")),
                };
            }
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
        Ok(())
    }
}

// -- Value parsers --

/// Parse an SSRC given in decimal, `0x` hexadecimal or leading-zero octal.
pub fn parse_ssrc(value: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        u32::from_str_radix(&value[1..], 8)
    } else {
        value.parse::<u32>()
    };
    parsed.map_err(|e| format!("not an unsigned 32-bit number ({})", e))
}

/// Parse `host[:port]` (IPv6 literals in brackets) into a socket address,
/// resolving host names.
pub fn parse_host(spec: &str, default_port: u16) -> Result<SocketAddr, String> {
    let spec = spec.trim();

    let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port),
            None if tail.is_empty() => None,
            None => return Err("unexpected characters after IPv6 literal".to_string()),
        };
        (host, port)
    } else {
        match spec.rsplit_once(':') {
            // More than one colon without brackets: a bare IPv6 literal
            Some((host, _)) if host.contains(':') => (spec, None),
            Some((host, port)) => (host, Some(port)),
            None => (spec, None),
        }
    };

    if host.is_empty() {
        return Err("missing host".to_string());
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| format!("invalid port {:?}", port))?,
        None => default_port,
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {:?}: {}", host, e))?
        .next()
        .ok_or_else(|| format!("{:?} did not resolve to any address", host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apple() -> InstanceConfig {
        let mut config = InstanceConfig::default();
        config.set("mode", "apple").unwrap();
        config
    }

    #[test]
    fn test_learn_rejected_in_apple_mode() {
        let mut config = apple();
        assert_eq!(
            config.set("learn", "true"),
            Err(ConfigError::ModeMismatch {
                option: "learn".to_string(),
                mode: Mode::Apple,
            })
        );
    }

    #[test]
    fn test_mode_specific_option_before_mode() {
        let mut config = InstanceConfig::default();
        assert_eq!(
            config.set("peer", "10.0.0.1"),
            Err(ConfigError::ModeNotSet("peer".to_string()))
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_locked_after_specific_option() {
        let mut config = InstanceConfig::default();
        config.set("mode", "apple").unwrap();
        // Still free to change before any mode-specific option
        config.set("mode", "direct").unwrap();
        config.set("learn", "true").unwrap();
        config.set("mode", "direct").unwrap();

        assert_eq!(
            config.set("mode", "apple"),
            Err(ConfigError::ModeLocked {
                current: Mode::Direct,
                requested: Mode::Apple,
            })
        );
        assert!(config.learn);
    }

    #[test]
    fn test_unknown_option() {
        let mut config = apple();
        assert_eq!(
            config.set("bogus", "1"),
            Err(ConfigError::UnknownOption("bogus".to_string()))
        );
        assert!(matches!(
            config.set("mode", "midi"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_peer_defaults_and_duplicates() {
        let mut config = InstanceConfig::default();
        config.set("mode", "direct").unwrap();
        config.set("peer", "10.0.0.9").unwrap();
        config.set("peer", "10.0.0.9:5004").unwrap();
        config.set("peer", "[::1]:6000").unwrap();

        assert_eq!(
            config.peers,
            vec![
                "10.0.0.9:5004".parse().unwrap(),
                "[::1]:6000".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_ssrc_radixes() {
        assert_eq!(parse_ssrc("4660"), Ok(4660));
        assert_eq!(parse_ssrc("0x1234"), Ok(0x1234));
        assert_eq!(parse_ssrc("011064"), Ok(0o11064));
        assert_eq!(parse_ssrc("0"), Ok(0));
        assert!(parse_ssrc("0x1_0000_0000").is_err());
        assert!(parse_ssrc("twelve").is_err());
    }

    #[test]
    fn test_parse_host_forms() {
        assert_eq!(parse_host("127.0.0.1", 5004), Ok("127.0.0.1:5004".parse().unwrap()));
        assert_eq!(parse_host("127.0.0.1:9000", 5004), Ok("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(parse_host("::1", 5004), Ok("[::1]:5004".parse().unwrap()));
        assert_eq!(parse_host("[fe80::1]:7", 5004), Ok("[fe80::1]:7".parse().unwrap()));
        assert!(parse_host("[::1", 5004).is_err());
        assert!(parse_host("127.0.0.1:port", 5004).is_err());
        assert!(parse_host(":5004", 5004).is_err());
    }

    #[test]
    fn test_invite_list_classification() {
        let mut config = apple();
        config.set("invite", "10.0.0.2:5004, Studio A, *").unwrap();
        config.set("invite", "10.0.0.3").unwrap();

        assert!(config.invite.all);
        assert_eq!(
            config.invite.endpoints,
            vec!["10.0.0.2:5004".parse().unwrap(), "10.0.0.3:5004".parse().unwrap()]
        );
        assert_eq!(config.invite.names, vec!["Studio A".to_string()]);
    }

    #[test]
    fn test_accept_filter() {
        let closed = AcceptFilter::default();
        assert!(!closed.allows(Some("anyone"), "10.0.0.1".parse().unwrap()));

        let mut config = apple();
        config.set("join", "Laptop, 10.0.0.1").unwrap();
        assert!(config.join.allows(Some("Laptop"), "192.168.1.1".parse().unwrap()));
        assert!(config.join.allows(None, "10.0.0.1".parse().unwrap()));
        assert!(!config.join.allows(Some("Phone"), "10.0.0.2".parse().unwrap()));

        config.set("join", "*").unwrap();
        assert!(config.join.allows(None, "10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_global_options() {
        let mut global = GlobalConfig::default();
        global.set("mdns-name", "studio").unwrap();
        assert_eq!(
            global.set("mdns-name", "other"),
            Err(ConfigError::Duplicate("mdns-name".to_string()))
        );

        global.set("mdns-bind", "192.168.1.10").unwrap();
        assert_eq!(global.mdns_bind, Some("192.168.1.10:5353".parse().unwrap()));
        assert!(global.set("mdns-bind", "0.0.0.0").is_err());

        global.set("detect", "on").unwrap();
        assert!(global.detect);
        assert!(global.set("detect", "maybe").is_err());
        assert!(global.set("peer", "x").is_err());
    }
}
