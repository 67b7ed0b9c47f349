//! ICMP echo prober.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TraceResult;
use crate::net::IcmpSocket;
use crate::packet::icmp::{
    self, EchoPacket, Quoted, DEST_UNREACHABLE_V4, DEST_UNREACHABLE_V6, ECHO_REPLY_V4,
    ECHO_REPLY_V6, HEADER_LEN, TIME_EXCEEDED_V4, TIME_EXCEEDED_V6,
};
use crate::probe::{check_hop_limit, ProbeReply, Prober, ProberSettings, SequenceAllocator};

pub struct IcmpProber {
    socket: IcmpSocket,
    identifier: u16,
    sequence: SequenceAllocator,
    timeout: Duration,
    cancel: CancellationToken,
}

impl IcmpProber {
    pub fn new(settings: &ProberSettings, cancel: CancellationToken) -> TraceResult<Self> {
        let socket = IcmpSocket::open(settings.v6, &settings.bind)?;
        Ok(Self {
            socket,
            identifier: (std::process::id() & 0xffff) as u16,
            sequence: SequenceAllocator::new(),
            timeout: settings.timeout,
            cancel,
        })
    }

    fn is_v6(&self) -> bool {
        self.socket.is_v6()
    }

    /// Run one echo exchange with an explicit identifier/sequence pair and
    /// a caller-chosen payload.
    ///
    /// Shared with the Paris-ICMP prober, which pins the identifier to its
    /// flow ID and compensates the checksum in the payload.
    pub(crate) fn exchange(
        socket: &IcmpSocket,
        cancel: &CancellationToken,
        timeout: Duration,
        dest: IpAddr,
        hop_limit: u8,
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
    ) -> TraceResult<ProbeReply> {
        let v6 = socket.is_v6();
        let wire = if v6 {
            EchoPacket::echo_request_v6(identifier, sequence, payload).marshal_zero_checksum()
        } else {
            EchoPacket::echo_request_v4(identifier, sequence, payload).marshal()
        };

        let sent = Instant::now();
        socket.send_to(dest, hop_limit, &wire)?;
        trace!(?dest, hop_limit, identifier, sequence, "sent echo request");

        let deadline = sent + timeout;
        let (echo_reply, time_exceeded, unreachable) = if v6 {
            (ECHO_REPLY_V6, TIME_EXCEEDED_V6, DEST_UNREACHABLE_V6)
        } else {
            (ECHO_REPLY_V4, TIME_EXCEEDED_V4, DEST_UNREACHABLE_V4)
        };

        loop {
            let (buf, from) = socket.recv(deadline, cancel)?;
            let msg: &[u8] = if socket.reads_include_ip_header() {
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

            if msg_type == echo_reply {
                let Ok(reply) = EchoPacket::parse(msg) else {
                    continue;
                };
                if reply.identifier == identifier && reply.sequence == sequence {
                    let rtt = icmp::payload_rtt(&reply.payload).unwrap_or_else(|| sent.elapsed());
                    debug!(?from, ?rtt, "echo reply from destination");
                    return Ok(ProbeReply::reached(
                        from,
                        rtt,
                        Some(msg_type),
                        Some(msg_code),
                    ));
                }
                continue;
            }

            if msg_type == time_exceeded || msg_type == unreachable {
                let body = &msg[HEADER_LEN..];
                let quoted = if v6 {
                    icmp::quoted_v6(body)
                } else {
                    icmp::quoted_v4(body)
                };
                let Ok(Quoted::Icmp {
                    identifier: quoted_id,
                    sequence: quoted_seq,
                }) = quoted
                else {
                    continue;
                };
                if quoted_id != identifier || quoted_seq != sequence {
                    // Another flow sharing the raw socket.
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
    }
}

impl Prober for IcmpProber {
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply> {
        check_hop_limit(hop_limit)?;
        debug_assert_eq!(dest.is_ipv6(), self.is_v6());
        let sequence = self.sequence.next();
        Self::exchange(
            &self.socket,
            &self.cancel,
            self.timeout,
            dest,
            hop_limit,
            self.identifier,
            sequence,
            icmp::timestamp_payload(&[]),
        )
    }

    fn name(&self) -> &'static str {
        "icmp"
    }

    fn requires_root(&self) -> bool {
        true
    }
}
