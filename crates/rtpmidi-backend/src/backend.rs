//! Backend lifecycle: instance arena, sockets, discovery and the per-cycle
//! dispatch path.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use rtpmidi_protocol::channel::ChannelIdent;

use crate::config::{GlobalConfig, Mode};
use crate::discovery::{route_advertisement, DiscoveryService};
use crate::error::{BackendError, InstanceFailure, Result};
use crate::instance::{ChannelEvent, Instance};
use crate::session::Port;
use crate::socket::{InstanceSockets, RECV_BUFFER_SIZE};

/// Index of an instance in the backend arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the channel events decoded during a dispatch cycle.
pub trait EventSink {
    fn deliver(&mut self, instance: InstanceId, name: &str, events: &[ChannelEvent]);
}

struct Slot {
    instance: Instance,
    /// None until started, or when binding failed
    sockets: Option<InstanceSockets>,
}

pub struct Backend {
    global: GlobalConfig,
    slots: Vec<Slot>,
    discovery: Option<DiscoveryService>,
    /// Session names we advertise ourselves
    own_names: HashSet<String>,
    started: bool,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("global", &self.global)
            .field("instances", &self.slots.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        Self {
            global: GlobalConfig::default(),
            slots: Vec::new(),
            discovery: None,
            own_names: HashSet::new(),
            started: false,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    // -- Configuration --

    /// Set a backend-wide option (`mdns-name`, `mdns-bind`, `detect`).
    pub fn configure(&mut self, option: &str, value: &str) -> Result<()> {
        self.global.set(option, value)?;
        Ok(())
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn create_instance(&mut self, name: &str) -> Result<InstanceId> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        if self.find_instance(name).is_some() {
            return Err(BackendError::DuplicateInstance(name.to_string()));
        }
        self.slots.push(Slot {
            instance: Instance::new(name),
            sockets: None,
        });
        Ok(InstanceId(self.slots.len() - 1))
    }

    pub fn configure_instance(&mut self, id: InstanceId, option: &str, value: &str) -> Result<()> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        self.slot_mut(id)?.instance.configure(option, value)?;
        Ok(())
    }

    /// Register a channel by its textual spec. Only registered channels are
    /// delivered to the event sink.
    pub fn channel(&mut self, id: InstanceId, spec: &str) -> Result<ChannelIdent> {
        let ident = ChannelIdent::parse(spec)?;
        self.slot_mut(id)?.instance.register_channel(ident);
        Ok(ident)
    }

    pub fn find_instance(&self, name: &str) -> Option<InstanceId> {
        self.slots
            .iter()
            .position(|s| s.instance.name() == name)
            .map(InstanceId)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.slots.get(id.0).map(|s| &s.instance)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.slots.get_mut(id.0).map(|s| &mut s.instance)
    }

    /// Address peers reach the instance on, once bound.
    pub fn local_addr(&self, id: InstanceId) -> Option<SocketAddr> {
        self.slots
            .get(id.0)?
            .sockets
            .as_ref()?
            .local_addr()
            .ok()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery.is_some()
    }

    fn slot_mut(&mut self, id: InstanceId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.0)
            .ok_or(BackendError::UnknownInstance(id.0))
    }

    // -- Lifecycle --

    /// Validate every instance, bind sockets and start discovery.
    ///
    /// Configuration errors abort the start and are reported for all failing
    /// instances at once. A socket that cannot be bound only disables its
    /// instance.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }

        let failures: Vec<InstanceFailure> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.instance.config().validate().err().map(|error| InstanceFailure {
                    instance: slot.instance.name().to_string(),
                    error,
                })
            })
            .collect();
        if !failures.is_empty() {
            for failure in &failures {
                error!(instance = %failure.instance, error = %failure.error, "Invalid instance configuration");
            }
            return Err(BackendError::Startup(failures));
        }

        for slot in &mut self.slots {
            let config = slot.instance.config();
            let bind = config.bind;
            let sockets = match config.mode {
                Mode::Apple => InstanceSockets::apple(bind),
                _ => InstanceSockets::direct(bind),
            };
            let sockets = match sockets {
                Ok(sockets) => sockets,
                Err(e) => {
                    error!(instance = %slot.instance.name(), bind = %bind, error = %e, "Failed to bind, instance disabled");
                    continue;
                }
            };

            slot.instance.set_detect(self.global.detect);
            slot.instance.start(now)?;
            if let Ok(addr) = sockets.local_addr() {
                info!(instance = %slot.instance.name(), addr = %addr, "Instance listening");
            }
            slot.sockets = Some(sockets);
            flush(slot);
        }

        if self.wants_discovery() {
            self.start_discovery();
        }

        self.started = true;
        Ok(())
    }

    fn wants_discovery(&self) -> bool {
        self.global.mdns_name.is_some()
            || self.slots.iter().any(|slot| {
                let config = slot.instance.config();
                match config.mode {
                    Mode::Direct => config.learn,
                    Mode::Apple => config.invite.all || !config.invite.names.is_empty(),
                    Mode::Unconfigured => false,
                }
            })
    }

    fn start_discovery(&mut self) {
        let discovery = match DiscoveryService::start(&self.global) {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!(error = %e, "mDNS unavailable, discovery disabled");
                return;
            }
        };

        if let Some(host) = self.global.mdns_name.clone() {
            for slot in &self.slots {
                if slot.instance.mode() != Mode::Apple {
                    continue;
                }
                let Some(addr) = slot.sockets.as_ref().and_then(|s| s.local_addr().ok()) else {
                    continue;
                };
                let session = slot.instance.session_name().to_string();
                match discovery.advertise(&session, &host, addr.port()) {
                    Ok(()) => {
                        self.own_names.insert(session);
                    }
                    Err(e) => warn!(session = %session, error = %e, "Failed to advertise session"),
                }
            }
        }

        self.discovery = Some(discovery);
    }

    /// One cycle: read every socket, route discovery results, run timers,
    /// send what was queued and hand decoded events to the sink.
    pub fn dispatch(&mut self, now: Instant, sink: &mut dyn EventSink) {
        if !self.started {
            return;
        }

        let buf = &mut self.buf;
        for slot in &mut self.slots {
            let Some(sockets) = &slot.sockets else {
                continue;
            };
            let instance = &mut slot.instance;
            sockets.drain(Port::Control, buf, |from, data| instance.handle_control(from, data, now));
            sockets.drain(Port::Data, buf, |from, data| instance.handle_data(from, data, now));
        }

        if let Some(discovery) = &mut self.discovery {
            for ad in discovery.poll() {
                let running = self
                    .slots
                    .iter_mut()
                    .filter(|slot| slot.sockets.is_some())
                    .map(|slot| &mut slot.instance);
                route_advertisement(&ad, running, &self.own_names, now);
            }
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.sockets.is_none() {
                continue;
            }
            slot.instance.poll(now);
            flush(slot);

            let events = slot.instance.take_events();
            if !events.is_empty() {
                sink.deliver(InstanceId(index), slot.instance.name(), &events);
            }
        }
    }

    /// Send events out of an instance.
    pub fn set(&mut self, id: InstanceId, events: &[ChannelEvent], now: Instant) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.sockets.is_none() {
            debug!(instance = %slot.instance.name(), "Instance not running, events dropped");
            return Ok(());
        }
        slot.instance.send(events, now)?;
        flush(slot);
        Ok(())
    }

    /// Release every socket and drop session state. Nothing is sent.
    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.instance.shutdown();
            slot.sockets = None;
        }
        if let Some(discovery) = self.discovery.take() {
            discovery.shutdown();
        }
        self.own_names.clear();
        if self.started {
            info!(instances = self.slots.len(), "Backend shut down");
        }
        self.started = false;
    }
}

fn flush(slot: &mut Slot) {
    let Some(sockets) = &slot.sockets else {
        return;
    };
    for out in slot.instance.take_outgoing() {
        match sockets.send_to(out.port, out.to, &out.payload) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(to = %out.to, "Socket busy, datagram dropped");
            }
            Err(e) => warn!(instance = %slot.instance.name(), to = %out.to, error = %e, "Send failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_duplicate_instance_rejected() {
        let mut backend = Backend::new();
        backend.create_instance("a").unwrap();
        assert!(matches!(
            backend.create_instance("a"),
            Err(BackendError::DuplicateInstance(_))
        ));
    }

    #[test]
    fn test_unknown_instance() {
        let mut backend = Backend::new();
        let err = backend
            .configure_instance(InstanceId(3), "mode", "direct")
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownInstance(3)));
    }

    #[test]
    fn test_start_reports_every_failing_instance() {
        let mut backend = Backend::new();
        let ok = backend.create_instance("ok").unwrap();
        backend.configure_instance(ok, "mode", "direct").unwrap();
        backend.configure_instance(ok, "bind", "127.0.0.1").unwrap();
        backend.create_instance("first").unwrap();
        backend.create_instance("second").unwrap();

        match backend.start(Instant::now()) {
            Err(BackendError::Startup(failures)) => {
                let names: Vec<_> = failures.iter().map(|f| f.instance.as_str()).collect();
                assert_eq!(names, vec!["first", "second"]);
                assert!(failures
                    .iter()
                    .all(|f| f.error == ConfigError::ModeNotSet("mode".to_string())));
            }
            other => panic!("expected startup failure, got {:?}", other.err()),
        }
        assert!(!backend.is_started());
    }

    #[test]
    fn test_channel_registration() {
        let mut backend = Backend::new();
        let id = backend.create_instance("a").unwrap();
        let ident = backend.channel(id, "channel3.cc7").unwrap();
        assert_eq!(ident.label(), 0x00B0_0307);
        assert!(matches!(
            backend.channel(id, "ch16.cc7"),
            Err(BackendError::Channel(_))
        ));
    }

    #[test]
    fn test_start_and_shutdown_direct() {
        let mut backend = Backend::new();
        let id = backend.create_instance("a").unwrap();
        backend.configure_instance(id, "mode", "direct").unwrap();
        backend.configure_instance(id, "bind", "127.0.0.1").unwrap();

        backend.start(Instant::now()).unwrap();
        assert!(backend.local_addr(id).is_some());
        assert!(!backend.discovery_enabled());
        assert!(matches!(
            backend.configure_instance(id, "learn", "true"),
            Err(BackendError::AlreadyStarted)
        ));

        backend.shutdown();
        assert!(backend.local_addr(id).is_none());
        assert!(!backend.is_started());
    }
}
