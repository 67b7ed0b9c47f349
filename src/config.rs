//! YAML configuration file: `defaults` that sit beneath the CLI flags and
//! `aliases` that rewrite targets before resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::args::Args;
use crate::enrich::EnrichmentConfig;
use crate::net::BindOptions;
use crate::probe::ProbeMethod;
use crate::trace::{AddrFamily, TraceConfig};

pub const CONFIG_TEMPLATE: &str = "\
# poros configuration
#
# Every key under `defaults` mirrors a command-line flag; flags given on
# the command line always win.
defaults:
  # probe_method: icmp   # icmp | udp | tcp
  # paris: false
  # max_hops: 30
  # queries: 3
  # timeout: 3s
  # first_hop: 1
  # sequential: false
  # port: 33434
  # ipv4: false
  # ipv6: false
  # tui: false
  # verbose: false
  # json: false
  # csv: false
  # no_color: false
  # enrichment:
  #   enabled: true
  #   rdns: true
  #   asn: true
  #   geoip: true

# Aliases expand before resolution: `poros dns` traces 9.9.9.9.
aliases: {}
#  dns: 9.9.9.9
";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub defaults: FileDefaults,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDefaults {
    pub tui: Option<bool>,
    pub verbose: Option<bool>,
    pub json: Option<bool>,
    pub csv: Option<bool>,
    pub no_color: Option<bool>,
    pub probe_method: Option<String>,
    pub paris: Option<bool>,
    pub max_hops: Option<u8>,
    pub queries: Option<u8>,
    pub timeout: Option<String>,
    pub first_hop: Option<u8>,
    pub sequential: Option<bool>,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
    pub port: Option<u16>,
    pub enrichment: Option<FileEnrichment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileEnrichment {
    pub enabled: Option<bool>,
    pub rdns: Option<bool>,
    pub asn: Option<bool>,
    pub geoip: Option<bool>,
}

/// Candidate config locations, most specific first.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("poros.yaml"),
        PathBuf::from("poros.yml"),
        PathBuf::from(".poros.yaml"),
        PathBuf::from(".poros.yml"),
    ];
    if let Some(dir) = config_dir() {
        paths.push(dir.join("poros").join("config.yaml"));
    }
    paths
}

/// The user-level config directory: `$XDG_CONFIG_HOME` when set,
/// otherwise the platform default (`~/.config`, `%APPDATA%`).
fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg));
        }
    }
    dirs::config_dir()
}

/// The path `config --init` writes to.
pub fn default_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("poros").join("config.yaml"))
}

/// Load the config file.
///
/// A missing file is only an error when `--config` named it explicitly.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        return parse(&text).with_context(|| format!("invalid config file {}", path.display()));
    }
    for path in search_paths() {
        if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            return parse(&text)
                .with_context(|| format!("invalid config file {}", path.display()));
        }
    }
    Ok(FileConfig::default())
}

pub fn parse(text: &str) -> Result<FileConfig> {
    Ok(serde_yaml::from_str(text)?)
}

/// The fully merged invocation: config-file defaults beneath CLI flags.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: String,
    pub trace: TraceConfig,
    pub tui: bool,
    pub verbose: bool,
    pub json: bool,
    pub csv: bool,
    pub html: Option<PathBuf>,
    pub no_color: bool,
}

pub fn resolve(args: &Args, file: &FileConfig) -> Result<Resolved> {
    let raw_target = args
        .target
        .clone()
        .context("no target given; try `poros <host>`")?;
    let target = file
        .aliases
        .get(&raw_target)
        .cloned()
        .unwrap_or(raw_target);

    let defaults = &file.defaults;
    let method = match args.probe_method() {
        Some(method) => method,
        None => method_from_defaults(defaults)?,
    };
    let family = match args.family() {
        Some(family) => family,
        None => match (
            defaults.ipv6.unwrap_or(false),
            defaults.ipv4.unwrap_or(false),
        ) {
            (true, _) => AddrFamily::V6,
            (_, true) => AddrFamily::V4,
            _ => AddrFamily::Any,
        },
    };
    let timeout = match args.timeout {
        Some(timeout) => timeout.into(),
        None => match &defaults.timeout {
            Some(text) => humantime::parse_duration(text)
                .with_context(|| format!("invalid timeout {text:?} in config file"))?,
            None => std::time::Duration::from_secs(3),
        },
    };

    let enrichment_defaults = defaults.enrichment.clone().unwrap_or_default();
    let enabled = !args.no_enrich && enrichment_defaults.enabled.unwrap_or(true);
    let enrichment = EnrichmentConfig {
        enabled,
        rdns: enabled && !args.no_rdns && enrichment_defaults.rdns.unwrap_or(true),
        asn: enabled && !args.no_asn && enrichment_defaults.asn.unwrap_or(true),
        geoip: enabled && !args.no_geoip && enrichment_defaults.geoip.unwrap_or(true),
        ..Default::default()
    };

    let trace = TraceConfig {
        method,
        probe_count: args.queries.or(defaults.queries).unwrap_or(3),
        max_hops: args.max_hops.or(defaults.max_hops).unwrap_or(30),
        first_hop: args.first_hop.or(defaults.first_hop).unwrap_or(1),
        timeout,
        port: args.port.or(defaults.port).unwrap_or(33434),
        family,
        sequential: args.sequential || defaults.sequential.unwrap_or(false),
        bind: BindOptions {
            source: args.source,
            interface: args.interface.clone(),
        },
        enrichment,
        ..Default::default()
    };

    Ok(Resolved {
        target,
        trace,
        tui: args.tui || defaults.tui.unwrap_or(false),
        verbose: args.verbose || defaults.verbose.unwrap_or(false),
        json: args.json || defaults.json.unwrap_or(false),
        csv: args.csv || defaults.csv.unwrap_or(false),
        html: args.html.clone(),
        no_color: args.no_color || defaults.no_color.unwrap_or(false),
    })
}

fn method_from_defaults(defaults: &FileDefaults) -> Result<ProbeMethod> {
    let paris = defaults.paris.unwrap_or(false);
    Ok(match (defaults.probe_method.as_deref(), paris) {
        (None | Some("icmp"), false) => ProbeMethod::Icmp,
        (Some("icmp"), true) => ProbeMethod::ParisIcmp,
        // Bare `paris: true` means Paris-UDP.
        (None | Some("udp"), true) => ProbeMethod::ParisUdp,
        (Some("udp"), false) => ProbeMethod::Udp,
        (Some("tcp"), _) => ProbeMethod::Tcp,
        (Some(other), _) => anyhow::bail!("unknown probe_method {other:?} in config file"),
    })
}
