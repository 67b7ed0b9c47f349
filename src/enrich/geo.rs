//! Geolocation backends behind the `GeoSource` capability: a live
//! ip-api.com HTTP lookup and an optional offline MaxMind reader.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::hop::{Asn, Geo};

const IP_API_FIELDS: &str = "status,country,countryCode,city,lat,lon";

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    city: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Where geolocation answers come from.
///
/// Both variants expose the same lookups so the enricher does not care
/// whether the data is fetched or memory-mapped.
pub enum GeoSource {
    IpApi { client: reqwest::Client },
    Mmdb(MmdbReader),
}

impl GeoSource {
    pub fn ip_api() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self::IpApi { client }
    }

    pub async fn lookup_geo(&self, ip: IpAddr) -> Option<Geo> {
        match self {
            Self::IpApi { client } => lookup_ip_api(client, ip).await,
            Self::Mmdb(reader) => reader.lookup_geo(ip),
        }
    }

    pub async fn lookup_asn(&self, ip: IpAddr) -> Option<Asn> {
        match self {
            // The live path resolves ASNs through Team Cymru instead.
            Self::IpApi { .. } => None,
            Self::Mmdb(reader) => reader.lookup_asn(ip),
        }
    }
}

async fn lookup_ip_api(client: &reqwest::Client, ip: IpAddr) -> Option<Geo> {
    let url = format!("http://ip-api.com/json/{ip}?fields={IP_API_FIELDS}");
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(%ip, error = %e, "geo request failed");
            return None;
        }
    };
    let body: IpApiResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            debug!(%ip, error = %e, "geo response malformed");
            return None;
        }
    };
    if body.status != "success" {
        return None;
    }
    Some(Geo {
        country: body.country.unwrap_or_default(),
        country_code: body.country_code.unwrap_or_default(),
        city: body.city,
        latitude: body.lat,
        longitude: body.lon,
    })
}

/// Offline MaxMind databases. A database that fails to open is disabled
/// with a warning; the trace continues without it.
pub struct MmdbReader {
    asn: Option<maxminddb::Reader<Vec<u8>>>,
    city: Option<maxminddb::Reader<Vec<u8>>>,
}

impl MmdbReader {
    pub fn open(asn_path: Option<&Path>, city_path: Option<&Path>) -> Self {
        let asn = asn_path.and_then(|path| match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "asn database disabled");
                None
            }
        });
        let city = city_path.and_then(|path| match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "city database disabled");
                None
            }
        });
        Self { asn, city }
    }

    pub fn is_enabled(&self) -> bool {
        self.asn.is_some() || self.city.is_some()
    }

    fn lookup_geo(&self, ip: IpAddr) -> Option<Geo> {
        let record: maxminddb::geoip2::City = self.city.as_ref()?.lookup(ip).ok()?;
        let country = record.country.as_ref();
        Some(Geo {
            country: country
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| (*name).to_string())
                .unwrap_or_default(),
            country_code: country
                .and_then(|c| c.iso_code)
                .map(str::to_string)
                .unwrap_or_default(),
            city: record
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| (*name).to_string()),
            latitude: record.location.as_ref().and_then(|l| l.latitude),
            longitude: record.location.as_ref().and_then(|l| l.longitude),
        })
    }

    fn lookup_asn(&self, ip: IpAddr) -> Option<Asn> {
        let record: maxminddb::geoip2::Asn = self.asn.as_ref()?.lookup(ip).ok()?;
        Some(Asn {
            number: record.autonomous_system_number?,
            org: record
                .autonomous_system_organization
                .map(str::to_string)
                .unwrap_or_default(),
            country: None,
        })
    }
}
