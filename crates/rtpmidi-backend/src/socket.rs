//! Non-blocking UDP sockets for instances.
//!
//! Direct mode uses a single data socket. Apple mode binds the control port
//! and the data port right above it.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::session::Port;

/// Attempts at finding an ephemeral control port whose successor is free.
const PAIR_BIND_ATTEMPTS: usize = 16;

/// Largest datagram read in one go
pub const RECV_BUFFER_SIZE: usize = 1500;

/// Create a non-blocking UDP socket bound to `addr`.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        // Accept IPv4-mapped traffic as well when bound to the wildcard
        let _ = socket.set_only_v6(false);
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The sockets of one running instance.
#[derive(Debug)]
pub struct InstanceSockets {
    pub control: Option<UdpSocket>,
    pub data: UdpSocket,
}

impl InstanceSockets {
    /// Single data socket for direct mode.
    pub fn direct(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            control: None,
            data: bind_udp(addr)?,
        })
    }

    /// Control socket on `addr` and data socket one port above. With port 0
    /// the system picks the control port, retried until its successor is free.
    pub fn apple(addr: SocketAddr) -> io::Result<Self> {
        if addr.port() != 0 {
            let control = bind_udp(addr)?;
            let data = bind_udp(next_port(addr)?)?;
            return Ok(Self {
                control: Some(control),
                data,
            });
        }

        let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no free control/data port pair");
        for _ in 0..PAIR_BIND_ATTEMPTS {
            let control = bind_udp(addr)?;
            let control_addr = control.local_addr()?;
            let Ok(data_addr) = next_port(control_addr) else {
                continue;
            };
            match bind_udp(data_addr) {
                Ok(data) => {
                    return Ok(Self {
                        control: Some(control),
                        data,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port = data_addr.port(), "Data port taken, retrying");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Address peers should contact: the control port in apple mode, the
    /// data port otherwise.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.control {
            Some(control) => control.local_addr(),
            None => self.data.local_addr(),
        }
    }

    /// Read every pending datagram from one port without blocking.
    pub fn drain(&self, port: Port, buf: &mut [u8], mut handle: impl FnMut(SocketAddr, &[u8])) {
        let socket = match port {
            Port::Control => match &self.control {
                Some(control) => control,
                None => return,
            },
            Port::Data => &self.data,
        };

        loop {
            match socket.recv_from(buf) {
                Ok((len, from)) => handle(from, &buf[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on
                // some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(error = %e, "Socket receive failed");
                    break;
                }
            }
        }
    }

    pub fn send_to(&self, port: Port, to: SocketAddr, payload: &[u8]) -> io::Result<usize> {
        let socket = match (port, &self.control) {
            (Port::Control, Some(control)) => control,
            _ => &self.data,
        };
        socket.send_to(payload, to)
    }
}

fn next_port(addr: SocketAddr) -> io::Result<SocketAddr> {
    let port = addr.port().checked_add(1).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "control port has no data port above it")
    })?;
    let mut next = addr;
    next.set_port(port);
    Ok(next)
}
