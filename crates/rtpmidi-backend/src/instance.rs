//! One configured RTP-MIDI endpoint.
//!
//! An [`Instance`] is sans-I/O: the owner feeds it datagrams received on its
//! control and data ports plus the current time, and collects the datagrams
//! it wants sent ([`Instance::take_outgoing`]) and the channel events it
//! decoded ([`Instance::take_events`]).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, info, warn};

use rtpmidi_protocol::apple::{ControlPacket, Exchange};
use rtpmidi_protocol::channel::ChannelIdent;
use rtpmidi_protocol::packets::{MidiCommand, RtpMidiPacket};
use rtpmidi_protocol::{PacketError, CLOCK_RATE_HZ};

use crate::config::{InstanceConfig, Mode};
use crate::error::ConfigError;
use crate::peers::{LearnedVia, LinkState, PeerHandle, PeerTable};
use crate::session::{Local, Port, SessionFailure, SessionTiming, Transmit};

/// Events per RTP packet; 4 bytes each at most keeps the command section
/// inside the 12-bit length field.
const MAX_EVENTS_PER_PACKET: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelEvent {
    pub ident: ChannelIdent,
    /// Normalized value, 0.0 to 1.0
    pub value: f64,
}

impl ChannelEvent {
    pub fn new(ident: ChannelIdent, value: f64) -> Self {
        Self { ident, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub port: Port,
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct Instance {
    name: String,
    config: InstanceConfig,
    timing: SessionTiming,
    detect: bool,
    started: bool,

    ssrc: u32,
    sequence: u16,
    epoch: Instant,

    peers: PeerTable,
    channels: HashSet<ChannelIdent>,
    outgoing: Vec<Outgoing>,
    events: Vec<ChannelEvent>,
}

impl Instance {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: InstanceConfig::default(),
            timing: SessionTiming::default(),
            detect: false,
            started: false,
            ssrc: 0,
            sequence: 0,
            epoch: Instant::now(),
            peers: PeerTable::new(Mode::Unconfigured),
            channels: HashSet::new(),
            outgoing: Vec::new(),
            events: Vec::new(),
        }
    }

    // -- Configuration --

    pub fn configure(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        self.config.set(option, value)
    }

    pub fn set_timing(&mut self, timing: SessionTiming) {
        self.timing = timing;
    }

    pub fn set_detect(&mut self, detect: bool) {
        self.detect = detect;
    }

    /// Only registered channels are delivered through [`Instance::take_events`].
    pub fn register_channel(&mut self, ident: ChannelIdent) {
        self.channels.insert(ident);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Session name offered in invitations and advertisements.
    pub fn session_name(&self) -> &str {
        self.config.session.as_deref().unwrap_or(&self.name)
    }

    // -- Lifecycle --

    /// Validate the configuration, pick the SSRC and contact static peers.
    pub fn start(&mut self, now: Instant) -> Result<(), ConfigError> {
        self.config.validate()?;

        self.epoch = now;
        self.ssrc = match self.config.ssrc {
            0 => random_ssrc(0, &[]),
            ssrc => ssrc,
        };
        self.peers = PeerTable::new(self.config.mode);
        self.started = true;

        info!(
            instance = %self.name,
            mode = %self.config.mode,
            ssrc = format_args!("{:#010x}", self.ssrc),
            "Instance started"
        );

        match self.config.mode {
            Mode::Direct => {
                for addr in self.config.peers.clone() {
                    self.peers.add(addr, LearnedVia::Static, now);
                }
                // Announce ourselves right away
                self.poll(now);
            }
            Mode::Apple => {
                for addr in self.config.invite.endpoints.clone() {
                    let handle = self.peers.add(addr, LearnedVia::Static, now);
                    self.invite(handle, now);
                }
            }
            Mode::Unconfigured => {}
        }
        Ok(())
    }

    /// Drop all peers and session state without sending anything.
    pub fn shutdown(&mut self) {
        self.peers = PeerTable::new(self.config.mode);
        self.outgoing.clear();
        self.events.clear();
        self.started = false;
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn take_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.events)
    }

    // -- Inbound --

    /// Datagram received on the control port (apple mode only).
    pub fn handle_control(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        if self.config.mode != Mode::Apple {
            return;
        }
        match ControlPacket::deserialize(data) {
            Ok(packet) => self.handle_control_packet(Port::Control, from, packet, now),
            Err(e) => debug!(instance = %self.name, from = %from, error = %e, "Dropping control datagram"),
        }
    }

    /// Datagram received on the data port.
    pub fn handle_data(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        if ControlPacket::is_control(data) {
            if self.config.mode != Mode::Apple {
                debug!(instance = %self.name, from = %from, "AppleMIDI packet in direct mode, ignored");
                return;
            }
            match ControlPacket::deserialize(data) {
                Ok(packet) => self.handle_control_packet(Port::Data, from, packet, now),
                Err(e) => debug!(instance = %self.name, from = %from, error = %e, "Dropping control datagram"),
            }
            return;
        }

        let packet = match RtpMidiPacket::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(instance = %self.name, from = %from, error = %e, "Malformed RTP-MIDI packet");
                return;
            }
        };

        match self.config.mode {
            Mode::Direct => {
                if packet.ssrc == self.ssrc {
                    self.regenerate_ssrc(now);
                }
                let known = self.peers.find(from).map(|p| p.handle);
                let handle = match known {
                    Some(handle) => Some(handle),
                    None if self.config.learn => {
                        info!(instance = %self.name, peer = %from, "Learned peer from inbound traffic");
                        Some(self.peers.add(from, LearnedVia::Invitation, now))
                    }
                    None => None,
                };
                if let Some(peer) = handle.and_then(|h| self.peers.get_mut(h)) {
                    peer.touch(now);
                    peer.remote_ssrc = Some(packet.ssrc);
                    if let Some(link) = peer.direct_mut() {
                        if link.state != LinkState::Active {
                            info!(instance = %self.name, peer = %from, "Peer active again");
                        }
                        link.state = LinkState::Active;
                        link.retry_at = None;
                    }
                }
            }
            Mode::Apple => {
                let established = self
                    .peers
                    .find_by_ssrc(packet.ssrc)
                    .filter(|p| p.session().is_some_and(|s| s.is_established()))
                    .map(|p| p.handle);
                match established.and_then(|h| self.peers.get_mut(h)) {
                    Some(peer) => peer.touch(now),
                    None => {
                        debug!(instance = %self.name, from = %from, ssrc = packet.ssrc, "RTP-MIDI from unknown session, dropped");
                        return;
                    }
                }
            }
            Mode::Unconfigured => return,
        }

        self.deliver(&packet.commands);
    }

    fn deliver(&mut self, commands: &[MidiCommand]) {
        for command in commands {
            let Some((ident, value)) = ChannelIdent::from_midi(&command.data) else {
                continue;
            };
            if self.detect {
                info!(instance = %self.name, channel = %ident, value, "Incoming data");
            }
            if self.channels.contains(&ident) {
                self.events.push(ChannelEvent { ident, value });
            }
        }
    }

    fn handle_control_packet(&mut self, port: Port, from: SocketAddr, packet: ControlPacket, now: Instant) {
        let remote_ssrc = packet.ssrc();
        if remote_ssrc == self.ssrc
            && matches!(packet, ControlPacket::Invitation(_) | ControlPacket::Accepted(_))
        {
            self.regenerate_ssrc(now);
        }

        match packet {
            ControlPacket::Invitation(ex) => self.on_invitation(port, from, ex, now),
            ControlPacket::Accepted(ex) => {
                let Some(handle) = self.peer_at(port, from) else {
                    debug!(instance = %self.name, from = %from, "Acceptance from unknown peer");
                    return;
                };
                let local = self.local(now);
                let timing = self.timing.clone();
                let mut out = Vec::new();
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.touch(now);
                    let accepted = peer
                        .session_mut()
                        .is_some_and(|s| s.on_accepted(port, &ex, &local, now, &timing, &mut out));
                    if accepted {
                        peer.remote_ssrc = Some(ex.ssrc);
                        if ex.name.is_some() {
                            peer.name = ex.name.clone();
                        }
                    }
                }
                self.flush_at(handle, out, now);
            }
            ControlPacket::Rejected(ex) => {
                let Some(handle) = self.peer_at(port, from) else {
                    return;
                };
                if let Some(session) = self.peers.get_mut(handle).and_then(|p| p.session_mut()) {
                    session.on_rejected(&ex);
                }
                self.settle(handle, now);
            }
            ControlPacket::End(ex) => {
                let handle = self
                    .peers
                    .find_by_ssrc(ex.ssrc)
                    .or_else(|| self.peers.find(from))
                    .map(|p| p.handle);
                let Some(handle) = handle else {
                    return;
                };
                if let Some(session) = self.peers.get_mut(handle).and_then(|p| p.session_mut()) {
                    session.on_end();
                }
                self.settle(handle, now);
            }
            ControlPacket::Sync { ssrc, count, timestamps } => {
                let Some(handle) = self.peers.find_by_ssrc(ssrc).map(|p| p.handle) else {
                    debug!(instance = %self.name, from = %from, ssrc, "Clock sync from unknown session");
                    return;
                };
                let local = self.local(now);
                let timing = self.timing.clone();
                let mut out = Vec::new();
                let mut completed = false;
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.touch(now);
                    if let Some(session) = peer.session_mut() {
                        completed = session.on_sync(count, timestamps, &local, now, &timing, &mut out);
                    }
                }
                if completed {
                    if let Some(peer) = self.peers.get(handle) {
                        info!(
                            instance = %self.name,
                            peer = %peer.address,
                            name = peer.name.as_deref().unwrap_or(""),
                            offset = ?peer.session().and_then(|s| s.offset()),
                            "Session established"
                        );
                    }
                }
                self.flush_at(handle, out, now);
            }
            ControlPacket::Feedback { ssrc, sequence } => {
                if let Some(handle) = self.peers.find_by_ssrc(ssrc).map(|p| p.handle) {
                    if let Some(peer) = self.peers.get_mut(handle) {
                        peer.touch(now);
                    }
                }
                debug!(instance = %self.name, ssrc, sequence, "Receiver feedback");
            }
        }
    }

    fn on_invitation(&mut self, port: Port, from: SocketAddr, ex: Exchange, now: Instant) {
        let existing = match port {
            Port::Control => self.peers.find(from).map(|p| p.handle),
            Port::Data => self
                .peers
                .find_by_ssrc(ex.ssrc)
                .or_else(|| self.peers.find_by_data_address(from))
                .map(|p| p.handle),
        };

        // Peers we chose to invite ourselves may always invite us back
        let permitted = self.config.join.allows(ex.name.as_deref(), from.ip())
            || existing
                .and_then(|h| self.peers.get(h))
                .is_some_and(|p| p.learned_via != LearnedVia::Invitation);

        let local = self.local(now);
        let timing = self.timing.clone();
        let mut out = Vec::new();

        let handle = match existing {
            Some(handle) => handle,
            None if port == Port::Control && permitted => {
                self.peers.add(from, LearnedVia::Invitation, now)
            }
            None => {
                info!(
                    instance = %self.name,
                    peer = %from,
                    name = ex.name.as_deref().unwrap_or(""),
                    "Rejecting invitation"
                );
                let reply = ControlPacket::Rejected(Exchange::new(ex.token, local.ssrc, Some(local.name.clone())));
                self.queue(port, from, &reply);
                return;
            }
        };

        let mut accepted = false;
        if let Some(peer) = self.peers.get_mut(handle) {
            peer.touch(now);
            if let Some(session) = peer.session_mut() {
                accepted = session.on_invitation(port, &ex, permitted, &local, now, &timing, &mut out);
            }
            if accepted {
                peer.remote_ssrc = Some(ex.ssrc);
                if ex.name.is_some() {
                    peer.name = ex.name.clone();
                }
            }
        }

        if accepted && port == Port::Control {
            info!(
                instance = %self.name,
                peer = %from,
                name = ex.name.as_deref().unwrap_or(""),
                "Accepted invitation"
            );
        }
        if !accepted && port == Port::Control {
            // Replies to unknown peers go back where the invitation came from
            for transmit in out.drain(..) {
                self.queue(transmit.port, from, &transmit.packet);
            }
            return;
        }
        self.flush_at(handle, out, now);
    }

    /// Peer matching an exchange packet's source, by port convention.
    fn peer_at(&self, port: Port, from: SocketAddr) -> Option<PeerHandle> {
        match port {
            Port::Control => self.peers.find(from),
            Port::Data => self.peers.find_by_data_address(from),
        }
        .map(|p| p.handle)
    }

    // -- Outbound --

    /// Send channel events to every reachable peer.
    pub fn send(&mut self, events: &[ChannelEvent], now: Instant) -> Result<(), PacketError> {
        if events.is_empty() || !self.started {
            return Ok(());
        }

        let targets: Vec<SocketAddr> = self
            .peers
            .all()
            .filter(|p| match p.session() {
                Some(session) => session.is_established(),
                None => true,
            })
            .map(|p| p.data_address())
            .collect();
        if targets.is_empty() {
            debug!(instance = %self.name, "No peers to send to");
            return Ok(());
        }

        for chunk in events.chunks(MAX_EVENTS_PER_PACKET) {
            let commands = chunk
                .iter()
                .map(|e| MidiCommand::new(0, e.ident.to_midi(e.value)))
                .collect();
            let payload = self.rtp_packet(commands, now)?;
            for to in &targets {
                self.outgoing.push(Outgoing {
                    port: Port::Data,
                    to: *to,
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn rtp_packet(&mut self, commands: Vec<MidiCommand>, now: Instant) -> Result<Vec<u8>, PacketError> {
        let packet = RtpMidiPacket {
            sequence: self.sequence,
            timestamp: self.clock(now) as u32,
            ssrc: self.ssrc,
            commands,
        };
        let mut buf = Vec::new();
        packet.serialize(&mut buf)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(buf)
    }

    fn queue(&mut self, port: Port, to: SocketAddr, packet: &ControlPacket) {
        let mut payload = Vec::new();
        packet.serialize(&mut payload);
        self.outgoing.push(Outgoing { port, to, payload });
    }

    /// React to a failed session: static peers are invited again after the
    /// reconnect delay, everyone else is dropped.
    fn settle(&mut self, handle: PeerHandle, now: Instant) {
        let reconnect = self.timing.reconnect_delay;
        let Some(peer) = self.peers.get_mut(handle) else {
            return;
        };
        let Some(failure) = peer.session_mut().and_then(|s| s.take_failure()) else {
            return;
        };

        let retry = peer.learned_via == LearnedVia::Static;
        match failure {
            SessionFailure::Ended => {
                info!(instance = %self.name, peer = %peer.address, "Session ended by peer")
            }
            _ => warn!(instance = %self.name, peer = %peer.address, reason = %failure, "Session failed"),
        }

        if retry {
            peer.remote_ssrc = None;
            if let Some(session) = peer.session_mut() {
                session.schedule_retry(now + reconnect);
            }
        } else {
            self.peers.remove(handle);
        }
    }

    // -- Timers --

    /// Drive handshake retries, keep-alives and liveness checks.
    pub fn poll(&mut self, now: Instant) {
        if !self.started {
            return;
        }
        match self.config.mode {
            Mode::Apple => {
                for handle in self.peers.handles() {
                    let local = self.local(now);
                    let timing = self.timing.clone();
                    let mut out = Vec::new();
                    if let Some(peer) = self.peers.get_mut(handle) {
                        let last_activity = peer.last_activity;
                        if let Some(session) = peer.session_mut() {
                            session.poll(&local, now, last_activity, &timing, &mut out);
                        }
                    }
                    self.flush_at(handle, out, now);
                }
            }
            Mode::Direct => self.poll_direct(now),
            Mode::Unconfigured => {}
        }
    }

    /// Queue session transmits to a peer's control or data address, then
    /// deal with any failure the session reported.
    fn flush_at(&mut self, handle: PeerHandle, out: Vec<Transmit>, now: Instant) {
        if let Some(peer) = self.peers.get(handle) {
            let control = peer.address;
            let data = peer.data_address();
            for transmit in out {
                let to = match transmit.port {
                    Port::Control => control,
                    Port::Data => data,
                };
                self.queue(transmit.port, to, &transmit.packet);
            }
        }
        self.settle(handle, now);
    }

    fn poll_direct(&mut self, now: Instant) {
        let timing = self.timing.clone();
        let mut probes = Vec::new();
        let mut dropped = Vec::new();

        for peer in self.peers.all_mut() {
            let silent = now.saturating_duration_since(peer.last_activity);
            let handle = peer.handle;
            let address = peer.address;
            let learned_via = peer.learned_via;
            let Some(link) = peer.direct_mut() else {
                continue;
            };

            match link.state {
                LinkState::Active if silent > timing.liveness_threshold => {
                    link.state = LinkState::TimedOut;
                    if learned_via == LearnedVia::Static {
                        link.retry_at = Some(now + timing.reconnect_delay);
                        warn!(instance = %self.name, peer = %address, "Peer timed out, scheduling reconnection probe");
                    } else {
                        warn!(instance = %self.name, peer = %address, "Peer timed out, removing");
                        dropped.push(handle);
                    }
                }
                LinkState::Active => {
                    if now >= link.next_keepalive {
                        link.next_keepalive = now + timing.keepalive_interval;
                        probes.push(address);
                    }
                }
                LinkState::TimedOut | LinkState::Probing => {
                    if link.retry_at.is_some_and(|at| now >= at) {
                        link.state = LinkState::Probing;
                        link.retry_at = Some(now + timing.reconnect_delay);
                        debug!(instance = %self.name, peer = %address, "Sending reconnection probe");
                        probes.push(address);
                    }
                }
            }
        }

        for handle in dropped {
            self.peers.remove(handle);
        }
        if probes.is_empty() {
            return;
        }

        // Keep-alives and probes are empty RTP-MIDI packets
        match self.rtp_packet(Vec::new(), now) {
            Ok(payload) => {
                for to in probes {
                    self.outgoing.push(Outgoing {
                        port: Port::Data,
                        to,
                        payload: payload.clone(),
                    });
                }
            }
            Err(e) => warn!(instance = %self.name, error = %e, "Failed to build keep-alive"),
        }
    }

    // -- Discovery hooks --

    /// Direct mode with `learn`: add a peer found through discovery.
    pub fn learn_peer(&mut self, address: SocketAddr, name: &str, now: Instant) -> bool {
        if !self.started || self.config.mode != Mode::Direct || !self.config.learn {
            return false;
        }
        let handle = self.peers.add(address, LearnedVia::Discovery, now);
        if let Some(peer) = self.peers.get_mut(handle) {
            if peer.name.is_none() {
                peer.name = Some(name.to_string());
            }
        }
        true
    }

    /// Apple mode: invite a discovered session if the invite list names it.
    pub fn invite_discovered(&mut self, address: SocketAddr, name: &str, now: Instant) -> bool {
        if !self.started || self.config.mode != Mode::Apple || !self.config.invite.matches_name(name) {
            return false;
        }
        let handle = self.peers.add(address, LearnedVia::Discovery, now);
        let idle = match self.peers.get_mut(handle) {
            Some(peer) => {
                peer.name = Some(name.to_string());
                peer.session().is_some_and(|s| s.can_invite() && s.retry_at().is_none())
            }
            None => false,
        };
        if idle {
            info!(instance = %self.name, peer = %address, session = name, "Inviting discovered session");
            self.invite(handle, now);
        }
        idle
    }

    fn invite(&mut self, handle: PeerHandle, now: Instant) {
        let local = self.local(now);
        let timing = self.timing.clone();
        let mut out = Vec::new();
        if let Some(session) = self.peers.get_mut(handle).and_then(|p| p.session_mut()) {
            session.invite(&local, now, &timing, &mut out);
        }
        self.flush_at(handle, out, now);
    }

    // -- Identity --

    /// Pick a new local SSRC after a collision and rebuild every live session
    /// under it.
    fn regenerate_ssrc(&mut self, now: Instant) {
        let known: Vec<u32> = self.peers.all().filter_map(|p| p.remote_ssrc).collect();
        let old = self.ssrc;
        self.ssrc = random_ssrc(old, &known);
        info!(
            instance = %self.name,
            old = format_args!("{:#010x}", old),
            new = format_args!("{:#010x}", self.ssrc),
            "SSRC collision, picked a new SSRC"
        );

        for handle in self.peers.handles() {
            let local = self.local(now);
            let timing = self.timing.clone();
            let mut out = Vec::new();
            if let Some(session) = self.peers.get_mut(handle).and_then(|p| p.session_mut()) {
                session.restart(old, &local, now, &timing, &mut out);
            }
            self.flush_at(handle, out, now);
        }
    }

    fn local(&self, now: Instant) -> Local {
        Local {
            ssrc: self.ssrc,
            name: self.session_name().to_string(),
            clock: self.clock(now),
        }
    }

    /// Local clock in 100 microsecond ticks since start.
    fn clock(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_micros() * u128::from(CLOCK_RATE_HZ) / 1_000_000) as u64
    }
}

/// Random nonzero SSRC different from `old` and every SSRC in `taken`.
fn random_ssrc(old: u32, taken: &[u32]) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let ssrc: u32 = rng.gen_range(1..=u32::MAX);
        if ssrc != old && !taken.contains(&ssrc) {
            return ssrc;
        }
    }
}
