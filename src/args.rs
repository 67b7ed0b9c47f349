use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};

use crate::probe::ProbeMethod;
use crate::trace::AddrFamily;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "poros")]
#[command(about = "A modern network path tracer with latency statistics and hop enrichment")]
#[command(version)]
#[command(group(ArgGroup::new("method").args(["icmp", "udp", "tcp"])))]
pub struct Args {
    /// Target hostname or IP address (or a config-file alias)
    pub target: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Use ICMP echo probes (default)
    #[arg(short = 'I', long)]
    pub icmp: bool,

    /// Use UDP probes to high ports
    #[arg(short = 'U', long)]
    pub udp: bool,

    /// Use TCP SYN probes
    #[arg(short = 'T', long)]
    pub tcp: bool,

    /// Keep flow identifiers constant across probes (Paris traceroute)
    #[arg(long)]
    pub paris: bool,

    /// Maximum number of hops [default: 30]
    #[arg(short = 'm', long)]
    pub max_hops: Option<u8>,

    /// Probes per hop [default: 3]
    #[arg(short = 'q', long)]
    pub queries: Option<u8>,

    /// Per-probe timeout [default: 3s]
    #[arg(short = 'w', long)]
    pub timeout: Option<humantime::Duration>,

    /// First hop to probe [default: 1]
    #[arg(short = 'f', long)]
    pub first_hop: Option<u8>,

    /// Probe hops one at a time instead of concurrently
    #[arg(long)]
    pub sequential: bool,

    /// Force IPv4
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Force IPv6
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Bind probes to a network interface
    #[arg(short = 'i', long, value_name = "NAME")]
    pub interface: Option<String>,

    /// Send probes from a specific source address
    #[arg(short = 's', long, value_name = "ADDR")]
    pub source: Option<IpAddr>,

    /// Destination port for UDP/TCP probes [default: 33434]
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Verbose logging and wider output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Emit the trace as JSON
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Emit the trace as CSV
    #[arg(long)]
    pub csv: bool,

    /// Write an HTML report to FILE
    #[arg(long, value_name = "FILE")]
    pub html: Option<PathBuf>,

    /// Interactive terminal UI
    #[arg(short = 't', long)]
    pub tui: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Disable all enrichment
    #[arg(long)]
    pub no_enrich: bool,

    /// Disable reverse DNS lookups
    #[arg(long)]
    pub no_rdns: bool,

    /// Disable ASN lookups
    #[arg(long)]
    pub no_asn: bool,

    /// Disable geolocation lookups
    #[arg(long)]
    pub no_geoip: bool,

    /// Explicit configuration file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print version information
    Version,
    /// Manage the configuration file
    Config {
        /// Write a commented starter config to the default location
        #[arg(long)]
        init: bool,
        /// Print the active configuration
        #[arg(long)]
        show: bool,
        /// Print the configuration file search path
        #[arg(long)]
        path: bool,
    },
}

impl Args {
    /// The probe method the flags select; `--paris` modifies ICMP/UDP.
    pub fn probe_method(&self) -> Option<ProbeMethod> {
        if self.tcp {
            Some(ProbeMethod::Tcp)
        } else if self.paris {
            if self.icmp {
                Some(ProbeMethod::ParisIcmp)
            } else {
                Some(ProbeMethod::ParisUdp)
            }
        } else if self.udp {
            Some(ProbeMethod::Udp)
        } else if self.icmp {
            Some(ProbeMethod::Icmp)
        } else {
            None
        }
    }

    pub fn family(&self) -> Option<AddrFamily> {
        if self.ipv6 {
            Some(AddrFamily::V6)
        } else if self.ipv4 {
            Some(AddrFamily::V4)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["poros", "example.com"]).unwrap();
        assert_eq!(args.target.as_deref(), Some("example.com"));
        assert!(args.max_hops.is_none());
        assert!(args.queries.is_none());
        assert!(args.probe_method().is_none());
        assert!(args.family().is_none());
        assert!(!args.sequential);
        assert!(!args.json);
    }

    #[test]
    fn test_args_custom_values() {
        let args = Args::try_parse_from([
            "poros",
            "--udp",
            "--max-hops",
            "40",
            "--queries",
            "5",
            "--timeout",
            "500ms",
            "--first-hop",
            "3",
            "--sequential",
            "--port",
            "33500",
            "--json",
            "google.com",
        ])
        .unwrap();

        assert_eq!(args.target.as_deref(), Some("google.com"));
        assert_eq!(args.probe_method(), Some(ProbeMethod::Udp));
        assert_eq!(args.max_hops, Some(40));
        assert_eq!(args.queries, Some(5));
        assert_eq!(
            args.timeout.map(std::time::Duration::from),
            Some(std::time::Duration::from_millis(500))
        );
        assert_eq!(args.first_hop, Some(3));
        assert!(args.sequential);
        assert_eq!(args.port, Some(33500));
        assert!(args.json);
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::try_parse_from([
            "poros", "-T", "-m", "25", "-q", "2", "-w", "1s", "-p", "443", "-4", "-v",
            "example.net",
        ])
        .unwrap();
        assert_eq!(args.probe_method(), Some(ProbeMethod::Tcp));
        assert_eq!(args.max_hops, Some(25));
        assert_eq!(args.port, Some(443));
        assert_eq!(args.family(), Some(AddrFamily::V4));
        assert!(args.verbose);
    }

    #[test]
    fn test_paris_variants() {
        let args = Args::try_parse_from(["poros", "--paris", "example.com"]).unwrap();
        assert_eq!(args.probe_method(), Some(ProbeMethod::ParisUdp));

        let args = Args::try_parse_from(["poros", "--paris", "-I", "example.com"]).unwrap();
        assert_eq!(args.probe_method(), Some(ProbeMethod::ParisIcmp));

        let args = Args::try_parse_from(["poros", "--paris", "-U", "example.com"]).unwrap();
        assert_eq!(args.probe_method(), Some(ProbeMethod::ParisUdp));
    }

    #[test]
    fn test_method_flags_conflict() {
        assert!(Args::try_parse_from(["poros", "-I", "-U", "example.com"]).is_err());
        assert!(Args::try_parse_from(["poros", "-4", "-6", "example.com"]).is_err());
    }

    #[test]
    fn test_subcommands_parse() {
        let args = Args::try_parse_from(["poros", "version"]).unwrap();
        assert!(matches!(args.command, Some(Command::Version)));

        let args = Args::try_parse_from(["poros", "config", "--show"]).unwrap();
        match args.command {
            Some(Command::Config { show, init, path }) => {
                assert!(show);
                assert!(!init);
                assert!(!path);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
