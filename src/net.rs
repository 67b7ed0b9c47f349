//! Raw-socket transports built on socket2.
//!
//! Three socket shapes cover every probe method: an ICMP socket that both
//! sends echoes and listens for errors, an unprivileged UDP sender, and a
//! raw TCP sender/listener pair. Hop limits are applied per send and all
//! reads take an absolute deadline, sliced so cancellation is observed
//! promptly.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{TraceError, TraceResult};

/// Largest packet any probe method reads.
const MAX_PACKET: usize = 1500;

/// Upper bound on a single blocking read; cancellation is checked between
/// slices.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Outbound binding options shared by every transport.
#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub source: Option<IpAddr>,
    pub interface: Option<String>,
}

fn apply_bindings(socket: &Socket, opts: &BindOptions) -> TraceResult<()> {
    if let Some(source) = opts.source {
        socket
            .bind(&SockAddr::from(SocketAddr::new(source, 0)))
            .map_err(TraceError::from_io)?;
    }
    if let Some(ref name) = opts.interface {
        bind_device(socket, name)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_device(socket: &Socket, name: &str) -> TraceResult<()> {
    socket
        .bind_device(Some(name.as_bytes()))
        .map_err(TraceError::from_io)
}

#[cfg(not(target_os = "linux"))]
fn bind_device(_socket: &Socket, _name: &str) -> TraceResult<()> {
    Err(TraceError::Transport(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "interface binding is only supported on linux",
    )))
}

fn set_hop_limit(socket: &Socket, v6: bool, hop_limit: u8) -> TraceResult<()> {
    if v6 {
        socket
            .set_unicast_hops_v6(u32::from(hop_limit))
            .map_err(TraceError::from_io)
    } else {
        socket
            .set_ttl(u32::from(hop_limit))
            .map_err(TraceError::from_io)
    }
}

/// Deadline-bounded receive shared by all transports.
fn recv_deadline(
    socket: &Socket,
    deadline: Instant,
    cancel: &CancellationToken,
) -> TraceResult<(Vec<u8>, IpAddr)> {
    loop {
        if cancel.is_cancelled() {
            return Err(TraceError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TraceError::Timeout);
        }
        let slice = (deadline - now).min(READ_SLICE);
        socket
            .set_read_timeout(Some(slice))
            .map_err(TraceError::from_io)?;

        let mut buf = [MaybeUninit::<u8>::uninit(); MAX_PACKET];
        match socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let bytes = buf[..len]
                    .iter()
                    .map(|b| unsafe { b.assume_init() })
                    .collect::<Vec<u8>>();
                let Some(from) = addr.as_socket().map(|sa| sa.ip()) else {
                    continue;
                };
                return Ok((bytes, from));
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(TraceError::from_io(e)),
        }
    }
}

/// An ICMP socket used both to send echoes and to listen for errors.
///
/// Opened raw where privileges allow; falls back to an unprivileged
/// datagram ICMP socket on systems that permit them.
pub struct IcmpSocket {
    socket: Socket,
    v6: bool,
    raw: bool,
}

impl IcmpSocket {
    pub fn open(v6: bool, opts: &BindOptions) -> TraceResult<Self> {
        let (domain, proto) = if v6 {
            (Domain::IPV6, Protocol::ICMPV6)
        } else {
            (Domain::IPV4, Protocol::ICMPV4)
        };
        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(proto)) {
            Ok(socket) => (socket, true),
            Err(raw_err) if raw_err.kind() == std::io::ErrorKind::PermissionDenied => {
                debug!("raw icmp socket refused, trying unprivileged datagram icmp");
                match Socket::new(domain, Type::DGRAM, Some(proto)) {
                    Ok(socket) => (socket, false),
                    Err(_) => return Err(TraceError::PermissionDenied(raw_err)),
                }
            }
            Err(e) => return Err(TraceError::from_io(e)),
        };
        apply_bindings(&socket, opts)?;
        Ok(Self { socket, v6, raw })
    }

    pub fn is_v6(&self) -> bool {
        self.v6
    }

    /// Whether inbound reads carry the IP header that must be stripped.
    ///
    /// Raw ICMPv4 sockets deliver the full IP packet; datagram ICMP and all
    /// ICMPv6 sockets deliver the ICMP message directly.
    pub fn reads_include_ip_header(&self) -> bool {
        !self.v6 && self.raw
    }

    pub fn send_to(&self, dest: IpAddr, hop_limit: u8, payload: &[u8]) -> TraceResult<()> {
        set_hop_limit(&self.socket, self.v6, hop_limit)?;
        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        self.socket
            .send_to(payload, &addr)
            .map_err(TraceError::from_io)?;
        Ok(())
    }

    pub fn recv(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> TraceResult<(Vec<u8>, IpAddr)> {
        recv_deadline(&self.socket, deadline, cancel)
    }
}

/// An unprivileged UDP sender bound to an ephemeral port.
pub struct UdpTransport {
    socket: Socket,
    local_port: u16,
    v6: bool,
}

impl UdpTransport {
    pub fn bind(v6: bool, opts: &BindOptions) -> TraceResult<Self> {
        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(TraceError::from_io)?;
        if let Some(ref name) = opts.interface {
            bind_device(&socket, name)?;
        }
        let local: SocketAddr = match (opts.source, v6) {
            (Some(addr), _) => SocketAddr::new(addr, 0),
            (None, false) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            (None, true) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };
        socket
            .bind(&SockAddr::from(local))
            .map_err(TraceError::from_io)?;
        let local_port = socket
            .local_addr()
            .map_err(TraceError::from_io)?
            .as_socket()
            .map(|sa| sa.port())
            .unwrap_or_default();
        Ok(Self {
            socket,
            local_port,
            v6,
        })
    }

    /// The OS-assigned source port, used as the probe identifier.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send_to(
        &self,
        dest: IpAddr,
        port: u16,
        hop_limit: u8,
        payload: &[u8],
    ) -> TraceResult<()> {
        set_hop_limit(&self.socket, self.v6, hop_limit)?;
        let addr = SockAddr::from(SocketAddr::new(dest, port));
        self.socket
            .send_to(payload, &addr)
            .map_err(TraceError::from_io)?;
        Ok(())
    }
}

/// A raw TCP sender/listener pair for SYN probing.
pub struct TcpRawSocket {
    send_socket: Socket,
    recv_socket: Socket,
    v6: bool,
}

impl TcpRawSocket {
    pub fn open(v6: bool, opts: &BindOptions) -> TraceResult<Self> {
        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
        let send_socket = Socket::new(domain, Type::RAW, Some(Protocol::TCP))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => TraceError::PermissionDenied(e),
                _ => TraceError::from_io(e),
            })?;
        let recv_socket = Socket::new(domain, Type::RAW, Some(Protocol::TCP))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => TraceError::PermissionDenied(e),
                _ => TraceError::from_io(e),
            })?;
        apply_bindings(&send_socket, opts)?;
        Ok(Self {
            send_socket,
            recv_socket,
            v6,
        })
    }

    pub fn reads_include_ip_header(&self) -> bool {
        !self.v6
    }

    pub fn send_to(&self, dest: IpAddr, hop_limit: u8, segment: &[u8]) -> TraceResult<()> {
        set_hop_limit(&self.send_socket, self.v6, hop_limit)?;
        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        self.send_socket
            .send_to(segment, &addr)
            .map_err(TraceError::from_io)?;
        Ok(())
    }

    pub fn recv(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> TraceResult<(Vec<u8>, IpAddr)> {
        recv_deadline(&self.recv_socket, deadline, cancel)
    }
}

/// Discover the local address the OS would use to reach `dest`.
///
/// Connects a throwaway UDP socket; no packets are sent.
pub fn discover_source_addr(dest: IpAddr) -> TraceResult<IpAddr> {
    let domain = if dest.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(TraceError::from_io)?;
    socket
        .connect(&SockAddr::from(SocketAddr::new(dest, 53)))
        .map_err(TraceError::from_io)?;
    socket
        .local_addr()
        .map_err(TraceError::from_io)?
        .as_socket()
        .map(|sa| sa.ip())
        .ok_or_else(|| {
            TraceError::Transport(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "local address discovery returned no address",
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_transport_records_bound_port() {
        let udp = UdpTransport::bind(false, &BindOptions::default()).unwrap();
        assert_ne!(udp.local_port(), 0);
    }

    #[test]
    fn test_udp_send_sets_ttl_per_send() {
        let udp = UdpTransport::bind(false, &BindOptions::default()).unwrap();
        // Loopback sends with distinct hop limits must both succeed.
        udp.send_to(Ipv4Addr::LOCALHOST.into(), 33434, 1, b"probe")
            .unwrap();
        udp.send_to(Ipv4Addr::LOCALHOST.into(), 33435, 64, b"probe")
            .unwrap();
    }

    #[test]
    fn test_invalid_source_addr_rejected() {
        let opts = BindOptions {
            // TEST-NET-1 is not a local address on any host running this.
            source: Some("192.0.2.200".parse().unwrap()),
            interface: None,
        };
        assert!(UdpTransport::bind(false, &opts).is_err());
    }

    #[test]
    fn test_discover_source_addr_loopback() {
        let addr = discover_source_addr(Ipv4Addr::LOCALHOST.into()).unwrap();
        assert!(addr.is_loopback());
    }

    #[test]
    fn test_recv_deadline_times_out() {
        let udp = UdpTransport::bind(false, &BindOptions::default()).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let res = recv_deadline(
            &udp.socket,
            Instant::now() + Duration::from_millis(120),
            &cancel,
        );
        assert!(matches!(res, Err(TraceError::Timeout)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_recv_observes_cancellation() {
        let udp = UdpTransport::bind(false, &BindOptions::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = recv_deadline(&udp.socket, Instant::now() + Duration::from_secs(5), &cancel);
        assert!(matches!(res, Err(TraceError::Cancelled)));
    }
}
