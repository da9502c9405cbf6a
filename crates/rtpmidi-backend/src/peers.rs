//! Per-instance table of remote endpoints.
//!
//! Owned by one instance and only touched from the dispatch path, so there is
//! no locking. Peers keep insertion order.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::config::Mode;
use crate::session::Session;

/// Stable peer id. Never reused within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u32);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a peer became known. Ordered by precedence: a peer is only ever
/// upgraded, never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LearnedVia {
    Discovery,
    Invitation,
    Static,
}

impl fmt::Display for LearnedVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovery => "discovery",
            Self::Invitation => "invitation",
            Self::Static => "static",
        })
    }
}

// -- Direct mode liveness --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    TimedOut,
    /// Timed out, reconnection probes being sent
    Probing,
}

#[derive(Debug, Clone)]
pub struct DirectLink {
    pub state: LinkState,
    /// Next reconnection probe while timed out
    pub retry_at: Option<Instant>,
    pub next_keepalive: Instant,
}

impl DirectLink {
    fn new(now: Instant) -> Self {
        Self {
            state: LinkState::Active,
            retry_at: None,
            next_keepalive: now,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerLink {
    Direct(DirectLink),
    Apple(Session),
}

// -- Peer --

#[derive(Debug, Clone)]
pub struct Peer {
    pub handle: PeerHandle,
    /// Data address in direct mode, control address in apple mode
    pub address: SocketAddr,
    pub remote_ssrc: Option<u32>,
    pub name: Option<String>,
    pub learned_via: LearnedVia,
    pub last_activity: Instant,
    pub link: PeerLink,
}

impl Peer {
    /// Where RTP-MIDI and clock sync packets go. AppleMIDI peers receive data
    /// one port above their control port.
    pub fn data_address(&self) -> SocketAddr {
        match self.link {
            PeerLink::Direct(_) => self.address,
            PeerLink::Apple(_) => {
                let mut addr = self.address;
                addr.set_port(addr.port().wrapping_add(1));
                addr
            }
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.link {
            PeerLink::Apple(session) => Some(session),
            PeerLink::Direct(_) => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match &mut self.link {
            PeerLink::Apple(session) => Some(session),
            PeerLink::Direct(_) => None,
        }
    }

    pub fn direct(&self) -> Option<&DirectLink> {
        match &self.link {
            PeerLink::Direct(link) => Some(link),
            PeerLink::Apple(_) => None,
        }
    }

    pub fn direct_mut(&mut self) -> Option<&mut DirectLink> {
        match &mut self.link {
            PeerLink::Direct(link) => Some(link),
            PeerLink::Apple(_) => None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

// -- Table --

#[derive(Debug)]
pub struct PeerTable {
    mode: Mode,
    peers: Vec<Peer>,
    next_handle: u32,
}

impl PeerTable {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            peers: Vec::new(),
            next_handle: 1,
        }
    }

    /// Add a peer, or return the existing one for this address. Re-adding
    /// only ever raises `learned_via`.
    pub fn add(&mut self, address: SocketAddr, via: LearnedVia, now: Instant) -> PeerHandle {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.address == address) {
            if via > peer.learned_via {
                debug!(peer = %address, from = %peer.learned_via, to = %via, "Peer precedence raised");
                peer.learned_via = via;
            }
            return peer.handle;
        }

        let handle = PeerHandle(self.next_handle);
        self.next_handle += 1;

        let link = match self.mode {
            Mode::Apple => PeerLink::Apple(Session::new()),
            Mode::Direct | Mode::Unconfigured => PeerLink::Direct(DirectLink::new(now)),
        };

        self.peers.push(Peer {
            handle,
            address,
            remote_ssrc: None,
            name: None,
            learned_via: via,
            last_activity: now,
            link,
        });
        debug!(peer = %address, handle = %handle, via = %via, "Peer added");
        handle
    }

    pub fn remove(&mut self, handle: PeerHandle) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.handle == handle)?;
        let peer = self.peers.remove(index);
        debug!(peer = %peer.address, handle = %handle, "Peer removed");
        Some(peer)
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&Peer> {
        self.peers.iter().find(|p| p.handle == handle)
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.handle == handle)
    }

    pub fn find(&self, address: SocketAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn find_mut(&mut self, address: SocketAddr) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.address == address)
    }

    pub fn find_by_data_address(&self, address: SocketAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| p.data_address() == address)
    }

    pub fn find_by_ssrc(&self, ssrc: u32) -> Option<&Peer> {
        self.peers.iter().find(|p| p.remote_ssrc == Some(ssrc))
    }

    /// All peers in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    /// Snapshot of handles, for walking the table while mutating it.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|p| p.handle).collect()
    }

    pub fn retain(&mut self, f: impl FnMut(&Peer) -> bool) {
        self.peers.retain(f);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
