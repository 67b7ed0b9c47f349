//! Reverse DNS lookups with negative caching.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::enrich::cache::Cache;
use crate::enrich::CacheValue;

/// Hostnames go stale quickly; five minutes matches typical PTR churn.
pub const RDNS_TTL: Duration = Duration::from_secs(5 * 60);

pub struct RdnsEnricher {
    resolver: TokioAsyncResolver,
    cache: Arc<Cache<CacheValue>>,
}

impl RdnsEnricher {
    pub fn new(resolver: TokioAsyncResolver, cache: Arc<Cache<CacheValue>>) -> Self {
        Self { resolver, cache }
    }

    /// Resolve the PTR name for `ip`; failures are cached as the empty
    /// string to damp repeat lookups.
    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        let key = format!("rdns:{ip}");
        if let Some(CacheValue::Hostname(name)) = self.cache.get(&key) {
            return (!name.is_empty()).then_some(name);
        }

        let name = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|ptr| ptr.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!(%ip, error = %e, "reverse lookup failed");
                None
            }
        };

        self.cache.set_with_ttl(
            &key,
            CacheValue::Hostname(name.clone().unwrap_or_default()),
            RDNS_TTL,
        );
        name
    }
}
