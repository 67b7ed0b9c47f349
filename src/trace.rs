//! Trace orchestration: target resolution, the per-hop probe loop in
//! sequential or bounded-worker form, destination detection, and the
//! final report assembly.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrich::{Enricher, EnrichmentConfig};
use crate::error::{TraceError, TraceResult};
use crate::hop::Hop;
use crate::net::BindOptions;
use crate::probe::{make_prober, ProbeMethod, Prober, ProberSettings};

/// Address family selection for resolution and probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFamily {
    #[default]
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub method: ProbeMethod,
    /// Probes per hop, 1-10.
    pub probe_count: u8,
    pub max_hops: u8,
    pub first_hop: u8,
    /// Per-probe timeout, at least 100ms.
    pub timeout: Duration,
    /// Destination port for UDP/TCP methods.
    pub port: u16,
    pub family: AddrFamily,
    pub sequential: bool,
    pub max_concurrency: usize,
    /// Fixed Paris flow ID; random when unset.
    pub flow_id: Option<u16>,
    pub bind: BindOptions,
    pub enrichment: EnrichmentConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::Icmp,
            probe_count: 3,
            max_hops: 30,
            first_hop: 1,
            timeout: Duration::from_secs(3),
            port: 33434,
            family: AddrFamily::Any,
            sequential: false,
            max_concurrency: 30,
            flow_id: None,
            bind: BindOptions::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl TraceConfig {
    pub fn validate(&self) -> TraceResult<()> {
        if self.max_hops == 0 {
            return Err(TraceError::InvalidMaxHops(self.max_hops));
        }
        if self.probe_count == 0 || self.probe_count > 10 {
            return Err(TraceError::InvalidProbeCount(self.probe_count));
        }
        if self.timeout < Duration::from_millis(100) {
            return Err(TraceError::InvalidTimeout(self.timeout));
        }
        if self.first_hop == 0 || self.first_hop > self.max_hops {
            return Err(TraceError::InvalidFirstHop {
                first: self.first_hop,
                max: self.max_hops,
            });
        }
        Ok(())
    }
}

/// Streaming consumer of completed hops.
///
/// Sequential traces emit in ascending TTL order; concurrent traces emit
/// in completion order.
pub trait HopSink: Send + Sync {
    fn hop_emitted(&self, hop: &Hop);
}

impl<F> HopSink for F
where
    F: Fn(&Hop) + Send + Sync,
{
    fn hop_emitted(&self, hop: &Hop) {
        self(hop);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub total_hops: usize,
    pub total_time_ms: f64,
    pub packet_loss_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub target: String,
    pub resolved_ip: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub probe_method: String,
    pub completed: bool,
    pub hops: Vec<Hop>,
    pub summary: TraceSummary,
}

pub struct Tracer {
    config: TraceConfig,
    resolver: TokioAsyncResolver,
    cancel: CancellationToken,
    sink: Option<Arc<dyn HopSink>>,
    enricher: Option<Enricher>,
}

impl Tracer {
    pub fn new(config: TraceConfig) -> TraceResult<Self> {
        config.validate()?;
        let mut opts = ResolverOpts::default();
        opts.ip_strategy = match config.family {
            AddrFamily::Any => LookupIpStrategy::Ipv4thenIpv6,
            AddrFamily::V4 => LookupIpStrategy::Ipv4Only,
            AddrFamily::V6 => LookupIpStrategy::Ipv6Only,
        };
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        let enricher = if config.enrichment.enabled {
            Some(Enricher::new(resolver.clone(), config.enrichment.clone()))
        } else {
            None
        };
        Ok(Self {
            config,
            resolver,
            cancel: CancellationToken::new(),
            sink: None,
            enricher,
        })
    }

    /// Install the streaming hop sink; the tracer owns it for the trace.
    pub fn with_sink(mut self, sink: Arc<dyn HopSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Token a caller can use to abort the trace.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Trace the forward path to `target`.
    pub async fn trace(&self, target: &str) -> TraceResult<TraceReport> {
        let timestamp = Utc::now();
        let dest = self.resolve(target).await?;
        info!(%target, %dest, method = self.config.method.name(), "starting trace");

        // A shared raw ICMP socket cannot demultiplex replies across
        // workers, so ICMP-family methods always run sequentially.
        let sequential = if !self.config.sequential && self.config.method.is_icmp_family() {
            warn!("icmp probing runs sequentially; concurrent mode applies to udp/tcp");
            true
        } else {
            self.config.sequential
        };

        let mut hops = if sequential {
            self.trace_sequential(dest).await?
        } else {
            self.trace_concurrent(dest).await?
        };

        if self.enricher.is_some() {
            self.apply_enrichment(&mut hops).await;
        }

        let completed = hops.last().map(|hop| hop.ip == Some(dest)).unwrap_or(false);
        let summary = summarize(&hops);
        info!(
            total_hops = summary.total_hops,
            completed, "trace finished"
        );
        Ok(TraceReport {
            target: target.to_string(),
            resolved_ip: dest,
            timestamp,
            probe_method: self.config.method.name().to_string(),
            completed,
            hops,
            summary,
        })
    }

    async fn resolve(&self, target: &str) -> TraceResult<IpAddr> {
        if let Ok(ip) = target.parse::<IpAddr>() {
            let family_ok = match self.config.family {
                AddrFamily::Any => true,
                AddrFamily::V4 => ip.is_ipv4(),
                AddrFamily::V6 => ip.is_ipv6(),
            };
            return if family_ok {
                Ok(ip)
            } else {
                Err(TraceError::Resolution(target.to_string()))
            };
        }

        let lookup = self
            .resolver
            .lookup_ip(target)
            .await
            .map_err(|_| TraceError::Resolution(target.to_string()))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        let chosen = match self.config.family {
            AddrFamily::V6 => addrs.iter().find(|a| a.is_ipv6()).copied(),
            AddrFamily::V4 => addrs.iter().find(|a| a.is_ipv4()).copied(),
            // IPv4 preferred unless IPv6 was asked for explicitly.
            AddrFamily::Any => addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied(),
        };
        chosen.ok_or_else(|| TraceError::Resolution(target.to_string()))
    }

    fn prober_settings(&self, dest: IpAddr) -> ProberSettings {
        ProberSettings {
            v6: dest.is_ipv6(),
            port: self.config.port,
            timeout: self.config.timeout,
            bind: self.config.bind.clone(),
            flow_id: self.config.flow_id,
        }
    }

    async fn trace_sequential(&self, dest: IpAddr) -> TraceResult<Vec<Hop>> {
        let cancel = self.cancel.clone();
        let mut prober = make_prober(
            self.config.method,
            dest,
            &self.prober_settings(dest),
            cancel.clone(),
        )?;

        let mut hops = Vec::new();
        for ttl in self.config.first_hop..=self.config.max_hops {
            if cancel.is_cancelled() {
                return Err(TraceError::Cancelled);
            }
            let count = self.config.probe_count;
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = probe_hop(prober.as_mut(), dest, ttl, count);
                (prober, result)
            })
            .await
            .map_err(join_error)?;
            prober = returned;
            let hop = result?;

            if let Some(sink) = &self.sink {
                sink.hop_emitted(&hop);
            }
            let reached = hop.ip == Some(dest);
            hops.push(hop);
            if reached {
                break;
            }
        }
        Ok(hops)
    }

    async fn trace_concurrent(&self, dest: IpAddr) -> TraceResult<Vec<Hop>> {
        let capacity = usize::from(self.config.max_hops);
        let worker_count = self.config.max_concurrency.clamp(1, capacity);
        let (ttl_tx, ttl_rx) = mpsc::channel::<u8>(capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<(u8, TraceResult<Hop>)>(capacity);
        let ttl_rx = Arc::new(tokio::sync::Mutex::new(ttl_rx));
        let worker_cancel = self.cancel.child_token();

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..worker_count {
            let ttl_rx = Arc::clone(&ttl_rx);
            let result_tx = result_tx.clone();
            let settings = self.prober_settings(dest);
            let cancel = worker_cancel.clone();
            let method = self.config.method;
            let count = self.config.probe_count;
            workers.spawn(async move {
                let mut prober = match make_prober(method, dest, &settings, cancel.clone()) {
                    Ok(prober) => prober,
                    Err(e) => {
                        let _ = result_tx.send((0, Err(e))).await;
                        return;
                    }
                };
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = { ttl_rx.lock().await.recv().await };
                    let Some(ttl) = next else { break };
                    let joined = tokio::task::spawn_blocking(move || {
                        let result = probe_hop(prober.as_mut(), dest, ttl, count);
                        (prober, result)
                    })
                    .await;
                    let Ok((returned, result)) = joined else { break };
                    prober = returned;
                    if result_tx.send((ttl, result)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        // Capacity equals max_hops, so submission never blocks on workers.
        for ttl in self.config.first_hop..=self.config.max_hops {
            if ttl_tx.send(ttl).await.is_err() {
                break;
            }
        }
        drop(ttl_tx);

        let mut results: BTreeMap<u8, Hop> = BTreeMap::new();
        let mut fatal: Option<TraceError> = None;
        while let Some((ttl, result)) = result_rx.recv().await {
            match result {
                Ok(hop) => {
                    if let Some(sink) = &self.sink {
                        sink.hop_emitted(&hop);
                    }
                    results.insert(ttl, hop);
                }
                Err(e) => {
                    debug!(ttl, error = %e, "worker failed, aborting trace");
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    worker_cancel.cancel();
                }
            }
        }
        while workers.join_next().await.is_some() {}

        if self.cancel.is_cancelled() {
            return Err(TraceError::Cancelled);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(assemble_hops(results, dest))
    }

    async fn apply_enrichment(&self, hops: &mut [Hop]) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        let ips: Vec<IpAddr> = hops.iter().filter_map(|hop| hop.ip).collect();
        let enriched = enricher.enrich_all(&ips, &self.cancel).await;
        for hop in hops.iter_mut() {
            let Some(ip) = hop.ip else { continue };
            if let Some(info) = enriched.get(&ip.to_string()) {
                hop.hostname = info.hostname.clone();
                hop.asn = info.asn.clone();
                hop.geo = info.geo.clone();
            }
        }
    }
}

/// Issue `count` probes at one TTL and aggregate them into a hop.
///
/// Timeouts and per-probe transport failures become -1 samples; only
/// errors that invalidate the prober itself propagate.
fn probe_hop(prober: &mut dyn Prober, dest: IpAddr, ttl: u8, count: u8) -> TraceResult<Hop> {
    let mut hop = Hop::new(ttl);
    for attempt in 0..count {
        match prober.probe(dest, ttl) {
            Ok(reply) => {
                hop.record_rtt(reply.rtt.as_secs_f64() * 1000.0);
                if let Some(addr) = reply.addr {
                    // Per-probe address disagreement is allowed; latest wins.
                    hop.ip = Some(addr);
                    hop.responded = true;
                }
            }
            Err(TraceError::Timeout) => hop.record_timeout(),
            Err(TraceError::Transport(e)) => {
                debug!(ttl, attempt, error = %e, "probe transport error");
                hop.record_timeout();
            }
            Err(e) => return Err(e),
        }
    }
    hop.finalize();
    Ok(hop)
}

/// Order results by TTL and truncate past the earliest hop that answered
/// from the destination itself.
fn assemble_hops(results: BTreeMap<u8, Hop>, dest: IpAddr) -> Vec<Hop> {
    let destination_ttl = results
        .iter()
        .filter(|(_, hop)| hop.responded && hop.ip == Some(dest))
        .map(|(ttl, _)| *ttl)
        .min();
    let mut hops = Vec::new();
    for (ttl, hop) in results {
        if let Some(limit) = destination_ttl {
            if ttl > limit {
                break;
            }
        }
        hops.push(hop);
    }
    hops
}

fn summarize(hops: &[Hop]) -> TraceSummary {
    let total_time_ms = hops
        .iter()
        .rev()
        .find(|hop| hop.responded)
        .map(|hop| hop.avg_rtt_ms)
        .unwrap_or(0.0);
    let packet_loss_percent = if hops.is_empty() {
        0.0
    } else {
        hops.iter().map(|hop| hop.loss_percent).sum::<f64>() / hops.len() as f64
    };
    TraceSummary {
        total_hops: hops.len(),
        total_time_ms,
        packet_loss_percent,
    }
}

fn join_error(err: tokio::task::JoinError) -> TraceError {
    TraceError::Transport(std::io::Error::new(std::io::ErrorKind::Other, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeReply;

    /// Prober with a canned reply script, one entry per probe call;
    /// exhausted scripts time out.
    struct ScriptedProber {
        script: Vec<TraceResult<ProbeReply>>,
    }

    impl ScriptedProber {
        fn new(script: Vec<TraceResult<ProbeReply>>) -> Self {
            Self { script }
        }
    }

    impl Prober for ScriptedProber {
        fn probe(&mut self, _dest: IpAddr, _hop_limit: u8) -> TraceResult<ProbeReply> {
            if self.script.is_empty() {
                return Err(TraceError::Timeout);
            }
            self.script.remove(0)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn requires_root(&self) -> bool {
            false
        }
    }

    fn reply(addr: &str, ms: u64, reached: bool) -> TraceResult<ProbeReply> {
        Ok(ProbeReply {
            addr: Some(addr.parse().unwrap()),
            rtt: Duration::from_millis(ms),
            icmp_type: Some(11),
            icmp_code: Some(0),
            reached,
            ttl_expired: !reached,
        })
    }

    #[test]
    fn test_config_validation() {
        let mut config = TraceConfig::default();
        assert!(config.validate().is_ok());

        config.max_hops = 0;
        assert!(matches!(
            config.validate(),
            Err(TraceError::InvalidMaxHops(0))
        ));

        config = TraceConfig {
            probe_count: 11,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TraceError::InvalidProbeCount(11))
        ));

        config = TraceConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TraceError::InvalidTimeout(_))
        ));

        config = TraceConfig {
            first_hop: 31,
            max_hops: 30,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TraceError::InvalidFirstHop { first: 31, max: 30 })
        ));
    }

    #[test]
    fn test_probe_hop_aggregation() {
        let mut prober = ScriptedProber::new(vec![
            reply("10.0.0.1", 10, false),
            Err(TraceError::Timeout),
            reply("10.0.0.9", 20, false),
        ]);
        let hop = probe_hop(&mut prober, "8.8.8.8".parse().unwrap(), 3, 3).unwrap();

        assert_eq!(hop.hop, 3);
        assert_eq!(hop.rtts.len(), 3);
        assert_eq!(hop.rtts[1], -1.0);
        // The latest responding address wins.
        assert_eq!(hop.ip, Some("10.0.0.9".parse().unwrap()));
        assert!(hop.responded);
        assert!((hop.loss_percent - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_probe_hop_all_timeouts() {
        let mut prober = ScriptedProber::new(vec![]);
        let hop = probe_hop(&mut prober, "8.8.8.8".parse().unwrap(), 7, 3).unwrap();
        assert_eq!(hop.rtts, vec![-1.0, -1.0, -1.0]);
        assert!(!hop.responded);
        assert!(hop.ip.is_none());
        assert_eq!(hop.loss_percent, 100.0);
    }

    #[test]
    fn test_probe_hop_cancellation_propagates() {
        let mut prober = ScriptedProber::new(vec![Err(TraceError::Cancelled)]);
        let result = probe_hop(&mut prober, "8.8.8.8".parse().unwrap(), 1, 3);
        assert!(matches!(result, Err(TraceError::Cancelled)));
    }

    fn responding_hop(ttl: u8, addr: &str) -> Hop {
        let mut hop = Hop::new(ttl);
        hop.ip = Some(addr.parse().unwrap());
        hop.responded = true;
        hop.record_rtt(f64::from(ttl) * 5.0);
        hop.finalize();
        hop
    }

    #[test]
    fn test_assemble_hops_truncates_at_destination() {
        let dest: IpAddr = "8.8.8.8".parse().unwrap();
        let mut results = BTreeMap::new();
        results.insert(1, responding_hop(1, "10.0.0.1"));
        results.insert(2, responding_hop(2, "8.8.8.8"));
        results.insert(3, responding_hop(3, "10.0.0.3"));

        let hops = assemble_hops(results, dest);
        assert_eq!(hops.len(), 2);
        assert_eq!(hops.last().unwrap().ip, Some(dest));
    }

    #[test]
    fn test_assemble_hops_orders_by_ttl_without_destination() {
        let dest: IpAddr = "8.8.8.8".parse().unwrap();
        let mut results = BTreeMap::new();
        results.insert(5, responding_hop(5, "10.0.0.5"));
        results.insert(2, responding_hop(2, "10.0.0.2"));
        results.insert(9, Hop::new(9));

        let hops = assemble_hops(results, dest);
        assert_eq!(hops.len(), 3);
        let ttls: Vec<u8> = hops.iter().map(|h| h.hop).collect();
        assert_eq!(ttls, vec![2, 5, 9]);
    }

    #[test]
    fn test_summarize() {
        let mut responder = responding_hop(2, "8.8.8.8");
        responder.record_timeout();
        responder.finalize();
        let mut silent = Hop::new(3);
        silent.record_timeout();
        silent.finalize();

        // Hop 3 never answered: it contributes 100% loss and is not the
        // total-time source.
        let hops = vec![responding_hop(1, "10.0.0.1"), responder, silent];
        let summary = summarize(&hops);
        assert_eq!(summary.total_hops, 3);
        assert_eq!(summary.total_time_ms, 10.0);
        assert!((summary.packet_loss_percent - (0.0 + 50.0 + 100.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_empty() {
        let summary = summarize(&[]);
        assert_eq!(summary.total_hops, 0);
        assert_eq!(summary.total_time_ms, 0.0);
        assert_eq!(summary.packet_loss_percent, 0.0);
    }

    #[tokio::test]
    async fn test_resolve_rejects_family_mismatch() {
        let tracer = Tracer::new(TraceConfig {
            family: AddrFamily::V6,
            ..Default::default()
        })
        .unwrap();
        let result = tracer.resolve("192.0.2.1").await;
        assert!(matches!(result, Err(TraceError::Resolution(_))));

        let tracer = Tracer::new(TraceConfig {
            family: AddrFamily::V4,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            tracer.resolve("192.0.2.1").await.unwrap(),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |hop: &Hop| {
            seen.lock().unwrap().push(hop.hop);
        };
        sink.hop_emitted(&Hop::new(4));
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }
}
