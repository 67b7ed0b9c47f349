//! Probe engines: one probe per call at a given hop limit, with the ICMP
//! error correlation that matches replies back to their probe.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{TraceError, TraceResult};
use crate::net::BindOptions;

pub mod icmp;
pub mod paris;
pub mod tcp;
pub mod udp;

pub use icmp::IcmpProber;
pub use paris::{ParisIcmpProber, ParisUdpProber};
pub use tcp::TcpProber;
pub use udp::UdpProber;

const MIN_SEQUENCE: u16 = 33000;
const MAX_SEQUENCE: u16 = 65535;

/// How probes are carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Icmp,
    Udp,
    Tcp,
    ParisUdp,
    ParisIcmp,
}

impl ProbeMethod {
    pub fn name(self) -> &'static str {
        match self {
            Self::Icmp => "icmp",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::ParisUdp => "paris-udp",
            Self::ParisIcmp => "paris-icmp",
        }
    }

    /// ICMP-family methods share one raw socket between send and receive.
    pub fn is_icmp_family(self) -> bool {
        matches!(self, Self::Icmp | Self::ParisIcmp)
    }
}

/// The correlated outcome of a single probe.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    /// Address that answered, if anything did.
    pub addr: Option<IpAddr>,
    pub rtt: Duration,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    /// The destination itself was identified.
    pub reached: bool,
    /// An intermediate router reported Time Exceeded.
    pub ttl_expired: bool,
}

impl ProbeReply {
    fn expired(addr: IpAddr, rtt: Duration, icmp_type: u8, icmp_code: u8) -> Self {
        Self {
            addr: Some(addr),
            rtt,
            icmp_type: Some(icmp_type),
            icmp_code: Some(icmp_code),
            reached: false,
            ttl_expired: true,
        }
    }

    fn reached(addr: IpAddr, rtt: Duration, icmp_type: Option<u8>, icmp_code: Option<u8>) -> Self {
        Self {
            addr: Some(addr),
            rtt,
            icmp_type,
            icmp_code,
            reached: true,
            ttl_expired: false,
        }
    }
}

/// Uniform contract over all probe methods.
///
/// Sockets are owned by the prober and released on drop.
pub trait Prober: Send {
    /// Issue one probe toward `dest` at the given hop limit and wait for
    /// the correlated response. Timeouts surface as `TraceError::Timeout`.
    fn probe(&mut self, dest: IpAddr, hop_limit: u8) -> TraceResult<ProbeReply>;

    fn name(&self) -> &'static str;

    fn requires_root(&self) -> bool;
}

/// Everything a prober needs beyond the method itself.
#[derive(Debug, Clone)]
pub struct ProberSettings {
    pub v6: bool,
    pub port: u16,
    pub timeout: Duration,
    pub bind: BindOptions,
    /// Fixed Paris flow identifier; random when unset.
    pub flow_id: Option<u16>,
}

/// Construct the prober for `method`.
pub fn make_prober(
    method: ProbeMethod,
    dest: IpAddr,
    settings: &ProberSettings,
    cancel: CancellationToken,
) -> TraceResult<Box<dyn Prober>> {
    Ok(match method {
        ProbeMethod::Icmp => Box::new(IcmpProber::new(settings, cancel)?),
        ProbeMethod::Udp => Box::new(UdpProber::new(settings, cancel)?),
        ProbeMethod::Tcp => Box::new(TcpProber::new(dest, settings, cancel)?),
        ProbeMethod::ParisUdp => Box::new(ParisUdpProber::new(settings, cancel)?),
        ProbeMethod::ParisIcmp => Box::new(ParisIcmpProber::new(settings, cancel)?),
    })
}

pub(crate) fn check_hop_limit(hop_limit: u8) -> TraceResult<()> {
    if hop_limit == 0 {
        return Err(TraceError::InvalidTtl(hop_limit));
    }
    Ok(())
}

/// Wrapping sequence allocator; unique per outstanding probe within the
/// timeout window since a prober has at most one probe in flight.
#[derive(Debug)]
pub(crate) struct SequenceAllocator {
    next: u16,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self { next: MIN_SEQUENCE }
    }

    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = if self.next == MAX_SEQUENCE {
            MIN_SEQUENCE
        } else {
            self.next + 1
        };
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(ProbeMethod::Icmp.name(), "icmp");
        assert_eq!(ProbeMethod::ParisUdp.name(), "paris-udp");
        assert!(ProbeMethod::Icmp.is_icmp_family());
        assert!(ProbeMethod::ParisIcmp.is_icmp_family());
        assert!(!ProbeMethod::Udp.is_icmp_family());
        assert!(!ProbeMethod::Tcp.is_icmp_family());
    }

    #[test]
    fn test_sequence_allocator_monotonic_and_wrapping() {
        let mut alloc = SequenceAllocator::new();
        let first = alloc.next();
        let second = alloc.next();
        assert_eq!(first, MIN_SEQUENCE);
        assert_eq!(second, MIN_SEQUENCE + 1);

        alloc.next = MAX_SEQUENCE;
        assert_eq!(alloc.next(), MAX_SEQUENCE);
        assert_eq!(alloc.next(), MIN_SEQUENCE);
    }

    #[test]
    fn test_zero_hop_limit_rejected() {
        assert!(matches!(check_hop_limit(0), Err(TraceError::InvalidTtl(0))));
        assert!(check_hop_limit(1).is_ok());
        assert!(check_hop_limit(255).is_ok());
    }
}
