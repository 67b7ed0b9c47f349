//! TCP SYN prober.
//!
//! Sends a half-open SYN from a rotating source port and watches two
//! inbound streams at once: raw TCP for a SYN+ACK or RST from the target,
//! and ICMP for errors from intermediate routers. The first valid
//! response wins.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{TraceError, TraceResult};
use crate::net::{discover_source_addr, IcmpSocket, TcpRawSocket};
use crate::packet::icmp::strip_ipv4_header;
use crate::packet::tcp::{SynSegment, TcpHeader};
use crate::probe::udp::await_quoted_error;
use crate::probe::{check_hop_limit, ProbeReply, Prober, ProberSettings, SequenceAllocator};

/// How long each inbound stream is watched before switching to the other.
const WATCH_SLICE: Duration = Duration::from_millis(50);

pub struct TcpProber {
    tcp: TcpRawSocket,
    icmp: IcmpSocket,
    src_addr: IpAddr,
    base_port: u16,
    target_port: u16,
    sequence: SequenceAllocator,
    timeout: Duration,
    cancel: CancellationToken,
    v6: bool,
}

impl TcpProber {
    pub fn new(
        dest: IpAddr,
        settings: &ProberSettings,
        cancel: CancellationToken,
    ) -> TraceResult<Self> {
        let tcp = TcpRawSocket::open(settings.v6, &settings.bind)?;
        let icmp = IcmpSocket::open(settings.v6, &settings.bind)?;
        let src_addr = match settings.bind.source {
            Some(addr) => addr,
            None => discover_source_addr(dest)?,
        };
        // Leave room for the +999 rotation below the port ceiling.
        let base_port = rand::thread_rng().gen_range(33000..60000);
        Ok(Self {
            tcp,
            icmp,
            src_addr,
            base_port,
            target_port: settings.port,
            sequence: SequenceAllocator::new(),
            timeout: settings.timeout,
            cancel,
            v6: settings.v6,
        })
    }

    /// Check the raw TCP stream for a reply addressed to this probe.
    fn poll_tcp_reply(&self, deadline: Instant, src_port: u16) -> TraceResult<Option<IpAddr>> {
        loop {
            let (buf, from) = match self.tcp.recv(deadline, &self.cancel) {
                Ok(read) => read,
                Err(TraceError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            };
            let segment: &[u8] = if self.tcp.reads_include_ip_header() {
                match strip_ipv4_header(&buf) {
                    Ok(inner) => inner,
                    Err(_) => continue,
                }
            } else {
                &buf
            };
            let Ok(header) = TcpHeader::parse(segment) else {
                continue;
            };
            if header.src_port == self.target_port
                && header.dst_port == src_port
                && header.is_reply()
            {
                return Ok(Some(from));
            }
        }
    }
}

impl Prober for TcpProber {
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply> {
        check_hop_limit(hop_limit)?;
        let sequence = self.sequence.next();
        let src_port = self.base_port + (sequence % 1000);
        let syn = SynSegment::new(src_port, self.target_port, u32::from(sequence) << 16);
        let wire = syn.marshal(self.src_addr, dest)?;

        let sent = Instant::now();
        self.tcp.send_to(dest, hop_limit, &wire)?;
        trace!(?dest, hop_limit, src_port, dst_port = self.target_port, "sent tcp syn");

        let deadline = sent + self.timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(TraceError::Timeout);
            }

            let slice = deadline.min(Instant::now() + WATCH_SLICE);
            if let Some(from) = self.poll_tcp_reply(slice, src_port)? {
                let rtt = sent.elapsed();
                debug!(?from, ?rtt, "tcp reply from destination");
                return Ok(ProbeReply::reached(from, rtt, None, None));
            }

            let slice = deadline.min(Instant::now() + WATCH_SLICE);
            match await_quoted_error(
                &self.icmp,
                &self.cancel,
                self.v6,
                sent,
                slice,
                |quoted_dst, quoted_src, quoted_port| {
                    quoted_src == src_port && quoted_port == self.target_port && quoted_dst == dest
                },
            ) {
                Ok(reply) => return Ok(reply),
                Err(TraceError::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn requires_root(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::BindOptions;

    fn settings() -> ProberSettings {
        ProberSettings {
            v6: false,
            port: 80,
            timeout: Duration::from_millis(200),
            bind: BindOptions::default(),
            flow_id: None,
        }
    }

    #[test]
    fn test_source_port_rotation_stays_in_range() {
        let Ok(mut prober) =
            TcpProber::new("127.0.0.1".parse().unwrap(), &settings(), CancellationToken::new())
        else {
            return;
        };
        for _ in 0..2000 {
            let sequence = prober.sequence.next();
            let src_port = prober.base_port + (sequence % 1000);
            assert!(src_port >= prober.base_port);
            assert!(src_port < prober.base_port + 1000);
        }
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let Ok(mut prober) =
            TcpProber::new("127.0.0.1".parse().unwrap(), &settings(), CancellationToken::new())
        else {
            return;
        };
        assert!(matches!(
            prober.probe("127.0.0.1".parse().unwrap(), 0),
            Err(TraceError::InvalidTtl(0))
        ));
    }
}
