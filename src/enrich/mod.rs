//! Hop enrichment: reverse DNS, ASN, and geolocation, fanned out with
//! bounded concurrency over the distinct responding addresses and backed
//! by one shared TTL+LRU cache.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hop::{Asn, Geo};

pub mod asn;
pub mod cache;
pub mod geo;
pub mod rdns;

use asn::AsnEnricher;
use cache::{Cache, DEFAULT_CAPACITY};
use geo::{GeoSource, MmdbReader};
use rdns::RdnsEnricher;

/// Geo answers share the ASN cadence.
const GEO_TTL: Duration = Duration::from_secs(60 * 60);

/// One opaque slot per backend in the shared cache.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Hostname(String),
    Asn(Option<Asn>),
    Geo(Option<Geo>),
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub rdns: bool,
    pub asn: bool,
    pub geoip: bool,
    /// Offline MaxMind databases; when present they replace the HTTP geo
    /// backend.
    pub mmdb_asn_path: Option<PathBuf>,
    pub mmdb_city_path: Option<PathBuf>,
    pub max_concurrency: usize,
    pub backend_timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rdns: true,
            asn: true,
            geoip: true,
            mmdb_asn_path: None,
            mmdb_city_path: None,
            max_concurrency: 10,
            backend_timeout: Duration::from_secs(3),
        }
    }
}

/// Addresses that carry no external enrichment: nil, loopback, RFC1918
/// private, and link-local unicast/multicast.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || (octets[0] == 224 && octets[1] == 0 && octets[2] == 0)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_unspecified()
                || v6.is_loopback()
                || (segments[0] & 0xffc0) == 0xfe80
                || (segments[0] & 0xff0f) == 0xff02
        }
    }
}

/// What the backends learned about one address.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub hostname: Option<String>,
    pub asn: Option<Asn>,
    pub geo: Option<Geo>,
}

struct EnricherInner {
    rdns: Option<RdnsEnricher>,
    asn: Option<AsnEnricher>,
    geo: Option<GeoSource>,
    cache: Arc<Cache<CacheValue>>,
    max_concurrency: usize,
    backend_timeout: Duration,
}

/// Fan-out enrichment over a hop set.
#[derive(Clone)]
pub struct Enricher {
    inner: Arc<EnricherInner>,
}

impl Enricher {
    pub fn new(resolver: TokioAsyncResolver, config: EnrichmentConfig) -> Self {
        let cache = Arc::new(Cache::new(DEFAULT_CAPACITY, rdns::RDNS_TTL));
        let rdns = config
            .rdns
            .then(|| RdnsEnricher::new(resolver.clone(), Arc::clone(&cache)));
        let asn = config
            .asn
            .then(|| AsnEnricher::new(resolver, Arc::clone(&cache)));
        let geo = config.geoip.then(|| {
            if config.mmdb_asn_path.is_some() || config.mmdb_city_path.is_some() {
                let reader = MmdbReader::open(
                    config.mmdb_asn_path.as_deref(),
                    config.mmdb_city_path.as_deref(),
                );
                if reader.is_enabled() {
                    return GeoSource::Mmdb(reader);
                }
            }
            GeoSource::ip_api()
        });
        Self {
            inner: Arc::new(EnricherInner {
                rdns,
                asn,
                geo,
                cache,
                max_concurrency: config.max_concurrency.max(1),
                backend_timeout: config.backend_timeout,
            }),
        }
    }

    /// The shared backend cache, exposed for inspection.
    pub fn cache(&self) -> &Arc<Cache<CacheValue>> {
        &self.inner.cache
    }

    /// Enrich one address. Private addresses and failed backends yield
    /// empty fields; nothing here ever fails the trace.
    pub async fn enrich_ip(&self, ip: IpAddr) -> Enrichment {
        if is_private(ip) {
            return Enrichment::default();
        }
        let timeout = self.inner.backend_timeout;
        let mut out = Enrichment::default();

        if let Some(rdns) = &self.inner.rdns {
            out.hostname = tokio::time::timeout(timeout, rdns.lookup(ip))
                .await
                .ok()
                .flatten();
        }
        if let Some(asn) = &self.inner.asn {
            out.asn = tokio::time::timeout(timeout, asn.lookup(ip))
                .await
                .ok()
                .flatten();
        }
        if let Some(geo) = &self.inner.geo {
            if out.asn.is_none() {
                out.asn = tokio::time::timeout(timeout, geo.lookup_asn(ip))
                    .await
                    .ok()
                    .flatten();
            }
            out.geo = self.lookup_geo_cached(geo, ip, timeout).await;
        }
        out
    }

    async fn lookup_geo_cached(
        &self,
        geo: &GeoSource,
        ip: IpAddr,
        timeout: Duration,
    ) -> Option<Geo> {
        let key = format!("geo:{ip}");
        if let Some(CacheValue::Geo(cached)) = self.inner.cache.get(&key) {
            return cached;
        }
        let result = tokio::time::timeout(timeout, geo.lookup_geo(ip))
            .await
            .ok()
            .flatten();
        self.inner
            .cache
            .set_with_ttl(&key, CacheValue::Geo(result.clone()), GEO_TTL);
        result
    }

    /// Enrich every distinct public address in `ips` concurrently.
    ///
    /// Returns a map keyed by the string form of each address; entries
    /// missing from the map carried no enrichment.
    pub async fn enrich_all(
        &self,
        ips: &[IpAddr],
        cancel: &CancellationToken,
    ) -> HashMap<String, Enrichment> {
        let mut seen = HashSet::new();
        let targets: Vec<IpAddr> = ips
            .iter()
            .copied()
            .filter(|ip| seen.insert(*ip) && !is_private(*ip))
            .collect();
        debug!(count = targets.len(), "enriching hop addresses");

        let semaphore = Arc::new(Semaphore::new(self.inner.max_concurrency));
        let mut tasks = JoinSet::new();
        for ip in targets {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    enrichment = this.enrich_ip(ip) => Some((ip.to_string(), enrichment)),
                }
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some((key, enrichment))) = joined {
                results.insert(key, enrichment);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};

    fn enricher(config: EnrichmentConfig) -> Enricher {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Enricher::new(resolver, config)
    }

    #[test]
    fn test_is_private_exact_set() {
        let private = [
            "0.0.0.0",
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.1",
            "169.254.10.20",
            "224.0.0.251",
            "::",
            "::1",
            "fe80::1",
            "ff02::1",
        ];
        for addr in private {
            assert!(is_private(addr.parse().unwrap()), "{addr} should be private");
        }

        let public = [
            "8.8.8.8",
            "1.1.1.1",
            "172.32.0.1",
            "192.0.2.1",
            "224.0.1.1",
            "2001:4860:4860::8888",
            "ff05::2",
        ];
        for addr in public {
            assert!(!is_private(addr.parse().unwrap()), "{addr} should be public");
        }
    }

    #[tokio::test]
    async fn test_private_address_yields_empty_enrichment() {
        let enricher = enricher(EnrichmentConfig::default());
        let result = enricher.enrich_ip("192.168.1.1".parse().unwrap()).await;
        assert!(result.hostname.is_none());
        assert!(result.asn.is_none());
        assert!(result.geo.is_none());
    }

    #[tokio::test]
    async fn test_enrich_all_skips_private_and_dedupes() {
        // All backends off: the fan-out itself is what is under test.
        let enricher = enricher(EnrichmentConfig {
            rdns: false,
            asn: false,
            geoip: false,
            ..Default::default()
        });
        let ips: Vec<IpAddr> = vec![
            "192.168.1.1".parse().unwrap(),
            "203.0.113.7".parse().unwrap(),
            "203.0.113.7".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        ];
        let cancel = CancellationToken::new();
        let results = enricher.enrich_all(&ips, &cancel).await;

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_enrich_all_observes_cancellation() {
        let enricher = enricher(EnrichmentConfig {
            rdns: false,
            asn: false,
            geoip: false,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ips: Vec<IpAddr> = vec!["203.0.113.7".parse().unwrap()];
        let results = enricher.enrich_all(&ips, &cancel).await;
        assert!(results.is_empty());
    }
}
