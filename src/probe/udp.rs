//! UDP high-port prober.
//!
//! Sends datagrams to `base_port + (seq mod 100)` and correlates ICMP
//! errors by the quoted destination port and destination address. A
//! Destination Unreachable of any code means the target host answered.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TraceResult;
use crate::net::{IcmpSocket, UdpTransport};
use crate::packet::icmp::{
    self, Quoted, DEST_UNREACHABLE_V4, DEST_UNREACHABLE_V6, HEADER_LEN, TIME_EXCEEDED_V4,
    TIME_EXCEEDED_V6,
};
use crate::probe::{check_hop_limit, ProbeReply, Prober, ProberSettings, SequenceAllocator};

pub struct UdpProber {
    udp: UdpTransport,
    listener: IcmpSocket,
    base_port: u16,
    sequence: SequenceAllocator,
    timeout: Duration,
    cancel: CancellationToken,
    v6: bool,
}

impl UdpProber {
    pub fn new(settings: &ProberSettings, cancel: CancellationToken) -> TraceResult<Self> {
        let udp = UdpTransport::bind(settings.v6, &settings.bind)?;
        let listener = IcmpSocket::open(settings.v6, &settings.bind)?;
        Ok(Self {
            udp,
            listener,
            base_port: settings.port,
            sequence: SequenceAllocator::new(),
            timeout: settings.timeout,
            cancel,
            v6: settings.v6,
        })
    }

    /// Payload head: (identifier, sequence, low timestamp bits), so our
    /// flows stay distinguishable even after the destination port wraps.
    fn payload(&self, sequence: u16) -> [u8; 8] {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u32;
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&self.udp.local_port().to_be_bytes());
        payload[2..4].copy_from_slice(&sequence.to_be_bytes());
        payload[4..8].copy_from_slice(&millis.to_be_bytes());
        payload
    }
}

/// Wait on `listener` for an ICMP error quoting a UDP or TCP probe of ours.
///
/// `matches` decides whether a quoted (dst_addr, src_port, dst_port)
/// triple belongs to the probe being awaited. Shared with the TCP prober
/// and with Paris-UDP, which keys on fixed flow ports instead of the
/// rotating one.
pub(crate) fn await_quoted_error(
    listener: &IcmpSocket,
    cancel: &CancellationToken,
    v6: bool,
    sent: Instant,
    deadline: Instant,
    matches: impl Fn(IpAddr, u16, u16) -> bool,
) -> TraceResult<ProbeReply> {
    let (time_exceeded, unreachable) = if v6 {
        (TIME_EXCEEDED_V6, DEST_UNREACHABLE_V6)
    } else {
        (TIME_EXCEEDED_V4, DEST_UNREACHABLE_V4)
    };
    loop {
        let (buf, from) = listener.recv(deadline, cancel)?;
        let msg: &[u8] = if listener.reads_include_ip_header() {
            match icmp::strip_ipv4_header(&buf) {
                Ok(inner) => inner,
                Err(_) => continue,
            }
        } else {
            &buf
        };
        if msg.len() < HEADER_LEN {
            continue;
        }
        let (msg_type, msg_code) = (msg[0], msg[1]);
        if msg_type != time_exceeded && msg_type != unreachable {
            continue;
        }

        let body = &msg[HEADER_LEN..];
        let quoted = if v6 {
            icmp::quoted_v6(body)
        } else {
            icmp::quoted_v4(body)
        };
        let Ok(Quoted::Transport {
            dst_addr,
            src_port,
            dst_port,
        }) = quoted
        else {
            continue;
        };
        if !matches(dst_addr, src_port, dst_port) {
            continue;
        }

        let rtt = sent.elapsed();
        if msg_type == time_exceeded {
            debug!(?from, ?rtt, "time exceeded");
            return Ok(ProbeReply::expired(from, rtt, msg_type, msg_code));
        }
        debug!(?from, ?rtt, code = msg_code, "destination unreachable");
        return Ok(ProbeReply::reached(
            from,
            rtt,
            Some(msg_type),
            Some(msg_code),
        ));
    }
}

impl Prober for UdpProber {
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply> {
        check_hop_limit(hop_limit)?;
        let sequence = self.sequence.next();
        let dst_port = self.base_port.wrapping_add(sequence % 100);
        let payload = self.payload(sequence);

        let sent = Instant::now();
        self.udp.send_to(dest, dst_port, hop_limit, &payload)?;
        trace!(?dest, hop_limit, dst_port, "sent udp probe");

        await_quoted_error(
            &self.listener,
            &self.cancel,
            self.v6,
            sent,
            sent + self.timeout,
            |quoted_dst, _src_port, quoted_port| quoted_port == dst_port && quoted_dst == dest,
        )
    }

    fn name(&self) -> &'static str {
        "udp"
    }

    fn requires_root(&self) -> bool {
        true
    }
}
