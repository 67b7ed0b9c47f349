//! Per-hop aggregation: the RTT vector, derived statistics, and the
//! enrichment fields attached after the trace completes.

use std::net::IpAddr;

use serde::Serialize;

/// A sample that never came back.
pub const TIMEOUT_RTT: f64 = -1.0;

#[derive(Debug, Clone, Serialize)]
pub struct Asn {
    pub number: u32,
    pub org: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Geo {
    pub country: String,
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// One hop on the forward path.
///
/// `rtts` holds one millisecond sample per probe, `TIMEOUT_RTT` marking
/// probes that never came back. Derived statistics cover the non-negative
/// samples only.
#[derive(Debug, Clone, Serialize)]
pub struct Hop {
    pub hop: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asn: Option<Asn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,
    pub rtts: Vec<f64>,
    pub avg_rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub responded: bool,
}

impl Hop {
    pub fn new(hop: u8) -> Self {
        Self {
            hop,
            ip: None,
            hostname: None,
            asn: None,
            geo: None,
            rtts: Vec::new(),
            avg_rtt_ms: 0.0,
            min_rtt_ms: 0.0,
            max_rtt_ms: 0.0,
            jitter_ms: 0.0,
            loss_percent: 0.0,
            responded: false,
        }
    }

    pub fn record_rtt(&mut self, ms: f64) {
        self.rtts.push(ms);
    }

    pub fn record_timeout(&mut self) {
        self.rtts.push(TIMEOUT_RTT);
    }

    /// Compute the derived statistics from the recorded samples.
    pub fn finalize(&mut self) {
        let stats = HopStats::from_samples(&self.rtts);
        self.min_rtt_ms = stats.min;
        self.avg_rtt_ms = stats.avg;
        self.max_rtt_ms = stats.max;
        self.jitter_ms = stats.jitter;
        self.loss_percent = stats.loss_percent;
    }
}

/// Statistics over an RTT sample vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HopStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub jitter: f64,
    pub loss_percent: f64,
}

impl HopStats {
    /// Min/avg/max/jitter over the non-negative samples (0.0 when there
    /// are none); loss is the share of negative samples.
    pub fn from_samples(rtts: &[f64]) -> Self {
        let answered: Vec<f64> = rtts.iter().copied().filter(|rtt| *rtt >= 0.0).collect();
        let timeouts = rtts.len() - answered.len();
        let loss_percent = if rtts.is_empty() {
            0.0
        } else {
            100.0 * timeouts as f64 / rtts.len() as f64
        };
        if answered.is_empty() {
            return Self {
                min: 0.0,
                avg: 0.0,
                max: 0.0,
                jitter: 0.0,
                loss_percent,
            };
        }
        let min = answered.iter().copied().fold(f64::INFINITY, f64::min);
        let max = answered.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = answered.iter().sum::<f64>() / answered.len() as f64;
        Self {
            min,
            avg,
            max,
            jitter: max - min,
            loss_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_mixed_samples() {
        let stats = HopStats::from_samples(&[10.0, -1.0, 20.0, -1.0]);
        assert_eq!(stats.avg, 15.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 20.0);
        assert_eq!(stats.jitter, 10.0);
        assert_eq!(stats.loss_percent, 50.0);
    }

    #[test]
    fn test_stats_all_timeouts() {
        let stats = HopStats::from_samples(&[-1.0, -1.0, -1.0]);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.avg, 0.0);
        assert_eq!(stats.max, 0.0);
        assert_eq!(stats.jitter, 0.0);
        assert_eq!(stats.loss_percent, 100.0);
    }

    #[test]
    fn test_stats_empty() {
        let stats = HopStats::from_samples(&[]);
        assert_eq!(stats.loss_percent, 0.0);
        assert_eq!(stats.avg, 0.0);
    }

    #[test]
    fn test_stats_ordering_invariant() {
        let vectors: [&[f64]; 4] = [
            &[1.0],
            &[5.0, 3.0, 9.0],
            &[0.2, 0.2, 0.2],
            &[100.0, -1.0, 50.0, 75.0, -1.0],
        ];
        for rtts in vectors {
            let stats = HopStats::from_samples(rtts);
            assert!(stats.min <= stats.avg, "min > avg for {rtts:?}");
            assert!(stats.avg <= stats.max, "avg > max for {rtts:?}");
            assert_eq!(stats.jitter, stats.max - stats.min);
        }
    }

    #[test]
    fn test_hop_finalize() {
        let mut hop = Hop::new(4);
        hop.record_rtt(12.5);
        hop.record_timeout();
        hop.record_rtt(17.5);
        hop.finalize();

        assert_eq!(hop.rtts, vec![12.5, -1.0, 17.5]);
        assert_eq!(hop.avg_rtt_ms, 15.0);
        assert_eq!(hop.jitter_ms, 5.0);
        assert!((hop.loss_percent - 100.0 / 3.0).abs() < 1e-9);
        assert!(!hop.responded);
    }

    #[test]
    fn test_hop_serializes_per_contract() {
        let mut hop = Hop::new(1);
        hop.ip = Some("192.0.2.1".parse().unwrap());
        hop.record_rtt(1.0);
        hop.finalize();
        hop.responded = true;

        let json = serde_json::to_value(&hop).unwrap();
        assert_eq!(json["hop"], 1);
        assert_eq!(json["ip"], "192.0.2.1");
        assert_eq!(json["responded"], true);
        // Absent enrichment stays out of the document entirely.
        assert!(json.get("hostname").is_none());
        assert!(json.get("asn").is_none());
        assert!(json.get("geo").is_none());
    }
}
