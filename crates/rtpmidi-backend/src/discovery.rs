//! mDNS discovery of RTP-MIDI sessions.
//!
//! Browses `_apple-midi._udp.local.` and turns resolved services into
//! [`Advertisement`]s. The backend routes each one to its instances:
//! direct-mode instances with `learn` add the peer, apple-mode instances
//! whose invite list names the session invite it. When `mdns-name` is set,
//! apple-mode instances are advertised as well.
//!
//! The mDNS daemon runs its own thread; events are drained from its channel
//! without blocking once per dispatch cycle.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use mdns_sd::{IfKind, Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use rtpmidi_protocol::{DEFAULT_MDNS_PORT, MDNS_SERVICE_TYPE};

use crate::config::GlobalConfig;
use crate::error::Result;
use crate::instance::Instance;

/// A resolved service announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_type: String,
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    /// Control port of the advertised session
    pub port: u16,
}

impl Advertisement {
    pub fn from_info(info: &ServiceInfo) -> Self {
        let service_type = info.get_type().to_string();
        let fullname = info.get_fullname();
        let instance_name = fullname
            .strip_suffix(service_type.as_str())
            .map(|name| name.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string();

        let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
        // Deterministic pick, IPv4 first
        addresses.sort_by_key(|ip| (ip.is_ipv6(), *ip));

        Self {
            service_type,
            instance_name,
            addresses,
            port: info.get_port(),
        }
    }

    fn preferred_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }
}

/// Hand an advertisement to every instance that wants it. Returns how many
/// instances acted on it.
pub fn route_advertisement<'a>(
    ad: &Advertisement,
    instances: impl IntoIterator<Item = &'a mut Instance>,
    own_names: &HashSet<String>,
    now: Instant,
) -> usize {
    if ad.service_type != MDNS_SERVICE_TYPE {
        debug!(service_type = %ad.service_type, "Ignoring unrelated service");
        return 0;
    }
    if own_names.contains(&ad.instance_name) {
        return 0;
    }
    let Some(ip) = ad.preferred_address() else {
        debug!(name = %ad.instance_name, "Advertisement without address");
        return 0;
    };

    let control = SocketAddr::new(ip, ad.port);
    let data = SocketAddr::new(ip, ad.port.wrapping_add(1));

    let mut routed = 0;
    for instance in instances {
        if instance.learn_peer(data, &ad.instance_name, now)
            || instance.invite_discovered(control, &ad.instance_name, now)
        {
            debug!(
                instance = %instance.name(),
                session = %ad.instance_name,
                peer = %control,
                "Routed advertisement"
            );
            routed += 1;
        }
    }
    routed
}

pub struct DiscoveryService {
    daemon: ServiceDaemon,
    browse: Receiver<ServiceEvent>,
}

impl DiscoveryService {
    /// Start the mDNS daemon and begin browsing.
    pub fn start(config: &GlobalConfig) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        if let Some(bind) = config.mdns_bind {
            if bind.port() != DEFAULT_MDNS_PORT {
                warn!(
                    port = bind.port(),
                    "mDNS always uses port {}, ignoring configured port", DEFAULT_MDNS_PORT
                );
            }
            if !bind.ip().is_unspecified() {
                daemon.disable_interface(IfKind::All)?;
                daemon.enable_interface(IfKind::Addr(bind.ip()))?;
                info!(interface = %bind.ip(), "mDNS restricted to one interface");
            }
        }

        let browse = daemon.browse(MDNS_SERVICE_TYPE)?;
        info!(service_type = MDNS_SERVICE_TYPE, "Browsing for RTP-MIDI sessions via mDNS");

        Ok(Self { daemon, browse })
    }

    /// Advertise a session on `<host>.local.` at its control port.
    pub fn advertise(&self, session: &str, host: &str, port: u16) -> Result<()> {
        let host_name = format!("{}.local.", host.trim_end_matches(".local."));
        let service_info = ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            session,
            &host_name,
            "",
            port,
            HashMap::<String, String>::new(),
        )?
        .enable_addr_auto();

        self.daemon.register(service_info)?;
        info!(session = %session, host = %host_name, port, "mDNS service registered");
        Ok(())
    }

    /// Drain pending browse events without blocking.
    pub fn poll(&mut self) -> Vec<Advertisement> {
        let mut found = Vec::new();
        while let Ok(event) = self.browse.try_recv() {
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let ad = Advertisement::from_info(&info);
                    debug!(
                        name = %ad.instance_name,
                        addresses = ?ad.addresses,
                        port = ad.port,
                        "RTP-MIDI session resolved"
                    );
                    found.push(ad);
                }
                ServiceEvent::ServiceRemoved(service_type, fullname) => {
                    debug!(service_type = %service_type, name = %fullname, "mDNS service removed");
                }
                ServiceEvent::ServiceFound(service_type, fullname) => {
                    debug!(
                        service_type = %service_type,
                        name = %fullname,
                        "mDNS service found (awaiting resolution)"
                    );
                }
                ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) => {}
            }
        }
        found
    }

    /// Stop the daemon. Advertisements are left to expire.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}
