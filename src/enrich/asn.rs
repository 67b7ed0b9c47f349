//! Team Cymru ASN lookups over DNS TXT.
//!
//! `<reversed-octets>.origin.asn.cymru.com` answers with
//! `"ASN | prefix | CC | registry | date"`; a second query at
//! `AS<n>.asn.cymru.com` yields the organization name in field 4.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::enrich::cache::Cache;
use crate::enrich::CacheValue;
use crate::hop::Asn;

/// Prefix-to-ASN mappings move slowly; an hour is plenty fresh.
pub const ASN_TTL: Duration = Duration::from_secs(60 * 60);

/// Build the origin query name for `ip`.
pub fn origin_query(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.origin.asn.cymru.com")
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for octet in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", octet & 0x0f));
                nibbles.push(format!("{:x}", octet >> 4));
            }
            format!("{}.origin6.asn.cymru.com", nibbles.join("."))
        }
    }
}

/// Parse an origin TXT record into (ASN, country).
///
/// Multi-origin prefixes list several ASNs in field 0; the first wins.
pub fn parse_origin(txt: &str) -> Option<(u32, Option<String>)> {
    let fields: Vec<&str> = txt.split('|').map(str::trim).collect();
    let number = fields.first()?.split_whitespace().next()?.parse().ok()?;
    let country = fields
        .get(2)
        .filter(|cc| !cc.is_empty())
        .map(ToString::to_string);
    Some((number, country))
}

/// Parse the AS description record; the org name sits in field 4.
pub fn parse_as_name(txt: &str) -> Option<String> {
    let fields: Vec<&str> = txt.split('|').map(str::trim).collect();
    fields
        .get(4)
        .filter(|org| !org.is_empty())
        .map(ToString::to_string)
}

pub struct AsnEnricher {
    resolver: TokioAsyncResolver,
    cache: Arc<Cache<CacheValue>>,
}

impl AsnEnricher {
    pub fn new(resolver: TokioAsyncResolver, cache: Arc<Cache<CacheValue>>) -> Self {
        Self { resolver, cache }
    }

    /// Look up the announcing ASN for `ip`; both positive and negative
    /// results are cached.
    pub async fn lookup(&self, ip: IpAddr) -> Option<Asn> {
        let key = format!("asn:{ip}");
        if let Some(CacheValue::Asn(cached)) = self.cache.get(&key) {
            return cached;
        }

        let result = self.query(ip).await;
        self.cache
            .set_with_ttl(&key, CacheValue::Asn(result.clone()), ASN_TTL);
        result
    }

    async fn query(&self, ip: IpAddr) -> Option<Asn> {
        let origin = self.txt_first(&origin_query(ip)).await?;
        let (number, country) = parse_origin(&origin)?;

        let org = match self.txt_first(&format!("AS{number}.asn.cymru.com")).await {
            Some(description) => parse_as_name(&description).unwrap_or_default(),
            None => String::new(),
        };
        Some(Asn {
            number,
            org,
            country,
        })
    }

    async fn txt_first(&self, name: &str) -> Option<String> {
        match self.resolver.txt_lookup(name.to_string()).await {
            Ok(lookup) => lookup.iter().next().map(|txt| txt.to_string()),
            Err(e) => {
                debug!(%name, error = %e, "txt lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_query_v4_reverses_octets() {
        assert_eq!(
            origin_query("8.8.8.8".parse().unwrap()),
            "8.8.8.8.origin.asn.cymru.com"
        );
        assert_eq!(
            origin_query("192.0.2.33".parse().unwrap()),
            "33.2.0.192.origin.asn.cymru.com"
        );
    }

    #[test]
    fn test_origin_query_v6_reverses_nibbles() {
        let query = origin_query("2001:db8::1".parse().unwrap());
        assert!(query.ends_with(".origin6.asn.cymru.com"));
        let nibbles: Vec<&str> = query
            .trim_end_matches(".origin6.asn.cymru.com")
            .split('.')
            .collect();
        assert_eq!(nibbles.len(), 32);
        // Low-order nibble of the last octet comes first.
        assert_eq!(nibbles[0], "1");
        assert_eq!(&nibbles[24..32], &["8", "b", "d", "0", "1", "0", "0", "2"]);
    }

    #[test]
    fn test_parse_origin() {
        assert_eq!(
            parse_origin("15169 | 8.8.8.0/24 | US | arin | 2014-03-14"),
            Some((15169, Some("US".to_string())))
        );
        assert_eq!(parse_origin("invalid"), None);
        assert_eq!(parse_origin(""), None);
        // Multi-origin takes the first ASN.
        assert_eq!(
            parse_origin("64512 64513 | 198.51.100.0/24 | DE | ripe | 2020-01-01"),
            Some((64512, Some("DE".to_string())))
        );
        // Missing country is tolerated.
        assert_eq!(parse_origin("15169 | 8.8.8.0/24 |"), Some((15169, None)));
    }

    #[test]
    fn test_parse_as_name() {
        assert_eq!(
            parse_as_name("15169 | US | arin | 2000-03-30 | GOOGLE, US"),
            Some("GOOGLE, US".to_string())
        );
        assert_eq!(parse_as_name("15169 | US | arin"), None);
        assert_eq!(parse_as_name("15169 | US | arin | 2000-03-30 |"), None);
    }
}
