//! Paris-style flow-constant probers.
//!
//! ECMP load balancers hash on the 5-tuple and, on some equipment, the
//! L4 checksum. Both variants here keep every hashed field constant
//! across the probes of one trace: ports and flow ID are fixed, and the
//! varying sequence word is paired with a compensation word `0xFFFF - seq`
//! so the one's-complement sum of the payload never changes.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::TraceResult;
use crate::net::{IcmpSocket, UdpTransport};
use crate::probe::icmp::IcmpProber;
use crate::probe::udp::await_quoted_error;
use crate::probe::{check_hop_limit, ProbeReply, Prober, ProberSettings};

/// Sequence numbers cycle through this window to tell probes apart.
const SEQ_MIN: u16 = 2;
const SEQ_MAX: u16 = 6;

const PARIS_PAYLOAD_LEN: usize = 16;

fn next_flow_sequence(current: u16) -> u16 {
    if current >= SEQ_MAX {
        SEQ_MIN
    } else {
        current + 1
    }
}

/// The 16-byte Paris-UDP payload.
///
/// Flow ID at [0..2] and [14..16], sequence at [2..4], compensation at
/// [12..14]; `seq + comp == 0xFFFF` keeps the UDP checksum constant.
fn paris_udp_payload(flow_id: u16, sequence: u16) -> [u8; PARIS_PAYLOAD_LEN] {
    let mut payload = [0u8; PARIS_PAYLOAD_LEN];
    payload[0..2].copy_from_slice(&flow_id.to_be_bytes());
    payload[2..4].copy_from_slice(&sequence.to_be_bytes());
    payload[12..14].copy_from_slice(&(0xffff - sequence).to_be_bytes());
    payload[14..16].copy_from_slice(&flow_id.to_be_bytes());
    payload
}

/// The Paris-ICMP payload: just the compensation word plus fixed filler.
///
/// Short enough that it can never be mistaken for a timestamp payload.
fn paris_icmp_payload(sequence: u16) -> Vec<u8> {
    let mut payload = vec![0u8; 6];
    payload[0..2].copy_from_slice(&(0xffff - sequence).to_be_bytes());
    payload
}

pub struct ParisUdpProber {
    udp: UdpTransport,
    listener: IcmpSocket,
    dst_port: u16,
    flow_id: u16,
    sequence: u16,
    timeout: Duration,
    cancel: CancellationToken,
    v6: bool,
}

impl ParisUdpProber {
    pub fn new(settings: &ProberSettings, cancel: CancellationToken) -> TraceResult<Self> {
        let udp = UdpTransport::bind(settings.v6, &settings.bind)?;
        let listener = IcmpSocket::open(settings.v6, &settings.bind)?;
        let flow_id = settings
            .flow_id
            .unwrap_or_else(|| rand::thread_rng().gen::<u16>());
        Ok(Self {
            udp,
            listener,
            dst_port: settings.port,
            flow_id,
            sequence: SEQ_MAX,
            timeout: settings.timeout,
            cancel,
            v6: settings.v6,
        })
    }

    pub fn flow_id(&self) -> u16 {
        self.flow_id
    }
}

impl Prober for ParisUdpProber {
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply> {
        check_hop_limit(hop_limit)?;
        self.sequence = next_flow_sequence(self.sequence);
        let payload = paris_udp_payload(self.flow_id, self.sequence);

        let sent = Instant::now();
        self.udp.send_to(dest, self.dst_port, hop_limit, &payload)?;
        trace!(
            ?dest,
            hop_limit,
            flow_id = self.flow_id,
            sequence = self.sequence,
            "sent paris-udp probe"
        );

        // Both ports are flow-constant, so the quoted 4-tuple identifies
        // the flow and the single outstanding probe within it.
        let src_port = self.udp.local_port();
        let dst_port = self.dst_port;
        await_quoted_error(
            &self.listener,
            &self.cancel,
            self.v6,
            sent,
            sent + self.timeout,
            |quoted_dst, quoted_src, quoted_port| {
                quoted_src == src_port && quoted_port == dst_port && quoted_dst == dest
            },
        )
    }

    fn name(&self) -> &'static str {
        "paris-udp"
    }

    fn requires_root(&self) -> bool {
        true
    }
}

pub struct ParisIcmpProber {
    socket: IcmpSocket,
    flow_id: u16,
    sequence: u16,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ParisIcmpProber {
    pub fn new(settings: &ProberSettings, cancel: CancellationToken) -> TraceResult<Self> {
        let socket = IcmpSocket::open(settings.v6, &settings.bind)?;
        let flow_id = settings
            .flow_id
            .unwrap_or_else(|| rand::thread_rng().gen::<u16>());
        Ok(Self {
            socket,
            flow_id,
            sequence: SEQ_MAX,
            timeout: settings.timeout,
            cancel,
        })
    }

    pub fn flow_id(&self) -> u16 {
        self.flow_id
    }
}

impl Prober for ParisIcmpProber {
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply> {
        check_hop_limit(hop_limit)?;
        self.sequence = next_flow_sequence(self.sequence);
        IcmpProber::exchange(
            &self.socket,
            &self.cancel,
            self.timeout,
            dest,
            hop_limit,
            self.flow_id,
            self.sequence,
            paris_icmp_payload(self.sequence),
        )
    }

    fn name(&self) -> &'static str {
        "paris-icmp"
    }

    fn requires_root(&self) -> bool {
        true
    }
}
