//! Output renderers: streaming plain text, a summary table, CSV, JSON,
//! and a self-contained HTML report.

use std::fmt::Write as _;

use crate::hop::Hop;
use crate::trace::{HopSink, TraceReport};

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Streaming sink that prints one traceroute-style line per hop.
pub struct StreamPrinter {
    no_color: bool,
}

impl StreamPrinter {
    pub fn new(no_color: bool) -> Self {
        Self { no_color }
    }
}

impl HopSink for StreamPrinter {
    fn hop_emitted(&self, hop: &Hop) {
        println!("{}", format_hop_line(hop, self.no_color));
    }
}

/// One plain-text hop line: number, host, enrichment tag, per-probe RTTs.
pub fn format_hop_line(hop: &Hop, no_color: bool) -> String {
    let (dim, reset) = if no_color { ("", "") } else { (DIM, RESET) };
    let mut line = format!("{:3}  ", hop.hop);

    match hop.ip {
        Some(ip) => {
            match &hop.hostname {
                Some(hostname) => {
                    let _ = write!(line, "{hostname} ({ip})");
                }
                None => {
                    let _ = write!(line, "{ip}");
                }
            }
            if let Some(asn) = &hop.asn {
                if asn.org.is_empty() {
                    let _ = write!(line, "  {dim}[AS{}]{reset}", asn.number);
                } else {
                    let _ = write!(line, "  {dim}[AS{} {}]{reset}", asn.number, asn.org);
                }
            }
            if let Some(geo) = &hop.geo {
                match &geo.city {
                    Some(city) => {
                        let _ = write!(line, "  {dim}{}, {}{reset}", city, geo.country_code);
                    }
                    None if !geo.country_code.is_empty() => {
                        let _ = write!(line, "  {dim}{}{reset}", geo.country_code);
                    }
                    None => {}
                }
            }
        }
        None => line.push('*'),
    }

    for rtt in &hop.rtts {
        if *rtt < 0.0 {
            line.push_str("  *");
        } else {
            let _ = write!(line, "  {rtt:.1} ms");
        }
    }
    line
}

/// Closing lines printed after a streamed trace.
pub fn render_summary(report: &TraceReport, no_color: bool) -> String {
    let (bold, reset) = if no_color { ("", "") } else { (BOLD, RESET) };
    let state = if report.completed {
        "complete"
    } else {
        "incomplete"
    };
    format!(
        "\n{bold}{}{reset} ({}): {} hops, {:.1} ms, {:.1}% loss, {state}",
        report.target,
        report.resolved_ip,
        report.summary.total_hops,
        report.summary.total_time_ms,
        report.summary.packet_loss_percent,
    )
}

/// Aligned statistics table, one row per hop.
pub fn render_table(report: &TraceReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>3} {:<40} {:>6} {:>7} {:>7} {:>7} {:>7} {:>6}",
        "Hop", "Host", "Loss%", "Avg", "Min", "Max", "Jttr", "Snt"
    );
    for hop in &report.hops {
        let host = match (&hop.hostname, hop.ip) {
            (Some(hostname), Some(ip)) => format!("{hostname} ({ip})"),
            (None, Some(ip)) => ip.to_string(),
            _ => "???".to_string(),
        };
        if hop.responded {
            let _ = writeln!(
                out,
                "{:>3} {:<40} {:>5.1}% {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>6}",
                hop.hop,
                host,
                hop.loss_percent,
                hop.avg_rtt_ms,
                hop.min_rtt_ms,
                hop.max_rtt_ms,
                hop.jitter_ms,
                hop.rtts.len(),
            );
        } else {
            let _ = writeln!(
                out,
                "{:>3} {:<40} {:>5.1}% {:>7} {:>7} {:>7} {:>7} {:>6}",
                hop.hop,
                host,
                hop.loss_percent,
                "???",
                "???",
                "???",
                "???",
                hop.rtts.len(),
            );
        }
    }
    out
}

pub const CSV_HEADER: &str =
    "hop,ip,hostname,asn,org,country,city,avg_rtt_ms,min_rtt_ms,max_rtt_ms,jitter_ms,loss_percent";

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_csv(report: &TraceReport) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for hop in &report.hops {
        let asn_number = hop
            .asn
            .as_ref()
            .map(|asn| asn.number.to_string())
            .unwrap_or_default();
        let org = hop.asn.as_ref().map(|asn| asn.org.clone()).unwrap_or_default();
        let country = hop
            .geo
            .as_ref()
            .map(|geo| geo.country.clone())
            .or_else(|| hop.asn.as_ref().and_then(|asn| asn.country.clone()))
            .unwrap_or_default();
        let city = hop
            .geo
            .as_ref()
            .and_then(|geo| geo.city.clone())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{:.1},{:.1},{:.1},{:.1},{:.1}",
            hop.hop,
            hop.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            csv_field(hop.hostname.as_deref().unwrap_or_default()),
            asn_number,
            csv_field(&org),
            csv_field(&country),
            csv_field(&city),
            hop.avg_rtt_ms,
            hop.min_rtt_ms,
            hop.max_rtt_ms,
            hop.jitter_ms,
            hop.loss_percent,
        );
    }
    out
}

pub fn render_json(report: &TraceReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

pub fn render_html(report: &TraceReport) -> String {
    let mut rows = String::new();
    for hop in &report.hops {
        let host = match (&hop.hostname, hop.ip) {
            (Some(hostname), Some(ip)) => format!("{hostname} ({ip})"),
            (None, Some(ip)) => ip.to_string(),
            _ => "*".to_string(),
        };
        let asn = hop
            .asn
            .as_ref()
            .map(|asn| format!("AS{} {}", asn.number, asn.org))
            .unwrap_or_default();
        let location = hop
            .geo
            .as_ref()
            .map(|geo| match &geo.city {
                Some(city) => format!("{city}, {}", geo.country),
                None => geo.country.clone(),
            })
            .unwrap_or_default();
        let _ = writeln!(
            rows,
            "      <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
             <td>{:.1}</td><td>{:.1}</td><td>{:.1}</td><td>{:.1}</td><td>{:.1}%</td></tr>",
            hop.hop,
            escape_html(&host),
            escape_html(&asn),
            escape_html(&location),
            hop.avg_rtt_ms,
            hop.min_rtt_ms,
            hop.max_rtt_ms,
            hop.jitter_ms,
            hop.loss_percent,
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>poros trace to {target}</title>
  <style>
    body {{ font-family: ui-monospace, monospace; margin: 2rem; color: #222; }}
    h1 {{ font-size: 1.2rem; }}
    table {{ border-collapse: collapse; }}
    th, td {{ padding: 0.3rem 0.8rem; border-bottom: 1px solid #ddd; text-align: left; }}
    th {{ background: #f4f4f4; }}
    .summary {{ margin-top: 1rem; color: #555; }}
  </style>
</head>
<body>
  <h1>poros: {target} ({resolved}) via {method}, {timestamp}</h1>
  <table>
    <thead>
      <tr><th>Hop</th><th>Host</th><th>ASN</th><th>Location</th>
      <th>Avg ms</th><th>Min ms</th><th>Max ms</th><th>Jitter ms</th><th>Loss</th></tr>
    </thead>
    <tbody>
{rows}    </tbody>
  </table>
  <p class="summary">{hops} hops, {time:.1} ms, {loss:.1}% loss, {state}</p>
</body>
</html>
"#,
        target = escape_html(&report.target),
        resolved = report.resolved_ip,
        method = report.probe_method,
        timestamp = report.timestamp.to_rfc3339(),
        rows = rows,
        hops = report.summary.total_hops,
        time = report.summary.total_time_ms,
        loss = report.summary.packet_loss_percent,
        state = if report.completed { "complete" } else { "incomplete" },
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::{Asn, Geo};
    use crate::trace::TraceSummary;
    use chrono::Utc;

    fn sample_report() -> TraceReport {
        let mut first = Hop::new(1);
        first.ip = Some("10.0.0.1".parse().unwrap());
        first.hostname = Some("gw.local".to_string());
        first.rtts = vec![1.0, 1.4, -1.0];
        first.responded = true;
        first.finalize();

        let mut last = Hop::new(2);
        last.ip = Some("8.8.8.8".parse().unwrap());
        last.hostname = Some("dns.google".to_string());
        last.asn = Some(Asn {
            number: 15169,
            org: "GOOGLE, US".to_string(),
            country: Some("US".to_string()),
        });
        last.geo = Some(Geo {
            country: "United States".to_string(),
            country_code: "US".to_string(),
            city: Some("Mountain View".to_string()),
            latitude: Some(37.4),
            longitude: Some(-122.1),
        });
        last.rtts = vec![8.0, 9.0, 10.0];
        last.responded = true;
        last.finalize();

        TraceReport {
            target: "dns.google".to_string(),
            resolved_ip: "8.8.8.8".parse().unwrap(),
            timestamp: Utc::now(),
            probe_method: "icmp".to_string(),
            completed: true,
            summary: TraceSummary {
                total_hops: 2,
                total_time_ms: 9.0,
                packet_loss_percent: 100.0 / 6.0,
            },
            hops: vec![first, last],
        }
    }

    #[test]
    fn test_hop_line_formats_rtts_and_timeouts() {
        let report = sample_report();
        let line = format_hop_line(&report.hops[0], true);
        assert!(line.contains("gw.local (10.0.0.1)"));
        assert!(line.contains("1.0 ms"));
        assert!(line.ends_with('*'));
        // Colored output wraps the enrichment tags only.
        let colored = format_hop_line(&report.hops[1], false);
        assert!(colored.contains("\x1b[2m"));
        let plain = format_hop_line(&report.hops[1], true);
        assert!(!plain.contains('\x1b'));
        assert!(plain.contains("[AS15169 GOOGLE, US]"));
        assert!(plain.contains("Mountain View, US"));
    }

    #[test]
    fn test_silent_hop_renders_star() {
        let mut hop = Hop::new(5);
        hop.rtts = vec![-1.0, -1.0, -1.0];
        hop.finalize();
        let line = format_hop_line(&hop, true);
        assert!(line.starts_with("  5  *"));
        assert_eq!(line.matches('*').count(), 4);
    }

    #[test]
    fn test_csv_contract() {
        let report = sample_report();
        let csv = render_csv(&report);
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        let row = lines.nth(1).unwrap();
        assert!(row.starts_with("2,8.8.8.8,dns.google,15169,"));
        // Fields with commas are quoted.
        assert!(row.contains("\"GOOGLE, US\""));
        assert!(row.contains("United States"));
        assert!(row.contains("Mountain View"));
    }

    #[test]
    fn test_json_contract_keys() {
        let report = sample_report();
        let json: serde_json::Value =
            serde_json::from_str(&render_json(&report).unwrap()).unwrap();
        assert_eq!(json["target"], "dns.google");
        assert_eq!(json["resolved_ip"], "8.8.8.8");
        assert_eq!(json["probe_method"], "icmp");
        assert_eq!(json["completed"], true);
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(json["hops"].as_array().unwrap().len(), 2);
        assert_eq!(json["hops"][1]["asn"]["number"], 15169);
        assert_eq!(json["summary"]["total_hops"], 2);
        assert_eq!(json["summary"]["total_time_ms"], 9.0);
    }

    #[test]
    fn test_table_alignment() {
        let report = sample_report();
        let table = render_table(&report);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Loss%"));
        assert!(lines[1].contains("gw.local (10.0.0.1)"));
    }

    #[test]
    fn test_html_report() {
        let report = sample_report();
        let html = render_html(&report);
        assert!(html.contains("<title>poros trace to dns.google</title>"));
        assert!(html.contains("dns.google (8.8.8.8)"));
        assert!(html.contains("AS15169"));
        assert!(html.contains("complete"));
    }
}
