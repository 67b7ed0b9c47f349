//! Live terminal UI: a single hop table that fills in as the trace
//! streams, with q/Esc cancelling the run.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    event::{Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Cell, Paragraph, Row, Table},
    Frame, Terminal,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Resolved;
use crate::error::TraceError;
use crate::hop::Hop;
use crate::trace::{HopSink, TraceReport, Tracer};

/// Sink that forwards completed hops into the UI loop.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Hop>,
}

impl HopSink for ChannelSink {
    fn hop_emitted(&self, hop: &Hop) {
        let _ = self.tx.send(hop.clone());
    }
}

pub async fn run_tui(resolved: &Resolved) -> anyhow::Result<Option<TraceReport>> {
    let (hop_tx, mut hop_rx) = mpsc::unbounded_channel::<Hop>();
    let tracer =
        Tracer::new(resolved.trace.clone())?.with_sink(Arc::new(ChannelSink { tx: hop_tx }));
    let cancel = tracer.cancellation_token();

    let target = resolved.target.clone();
    let trace_handle = tokio::spawn(async move { tracer.trace(&target).await });

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Keyboard events come in over a channel so the draw loop can select
    // across input and hop updates.
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Event>();
    let input_handle = tokio::spawn(async move {
        loop {
            if let Ok(true) = crossterm::event::poll(Duration::from_millis(16)) {
                if let Ok(event) = crossterm::event::read() {
                    if input_tx.send(event).is_err() {
                        break;
                    }
                }
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    });

    let mut hops: Vec<Hop> = Vec::new();
    let mut tracing_done = false;
    terminal.draw(|f| render(f, &resolved.target, &hops, tracing_done))?;

    loop {
        tokio::select! {
            received = hop_rx.recv() => {
                match received {
                    Some(hop) => {
                        match hops.iter_mut().find(|existing| existing.hop == hop.hop) {
                            Some(existing) => *existing = hop,
                            None => hops.push(hop),
                        }
                        hops.sort_by_key(|hop| hop.hop);
                        terminal.draw(|f| render(f, &resolved.target, &hops, tracing_done))?;
                    }
                    None => {
                        // The tracer dropped its sink: the trace is over.
                        tracing_done = true;
                        terminal.draw(|f| render(f, &resolved.target, &hops, tracing_done))?;
                        break;
                    }
                }
            }
            input = input_rx.recv() => {
                if let Some(Event::Key(key)) = input {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            cancel.cancel();
                            break;
                        }
                        _ => {}
                    }
                } else if input.is_none() {
                    break;
                }
            }
        }
    }

    input_handle.abort();
    let result = trace_handle.await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    match result {
        Ok(Ok(report)) => Ok(Some(report)),
        Ok(Err(TraceError::Cancelled)) => {
            debug!("trace cancelled from the ui");
            Ok(None)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}

fn render(f: &mut Frame, target: &str, hops: &[Hop], done: bool) {
    let area = f.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(3)])
        .split(area);

    let state = if done { "done" } else { "tracing" };
    let status = Paragraph::new(format!("poros → {target}  [{state}]  q: quit"))
        .style(Style::default().add_modifier(Modifier::BOLD));
    f.render_widget(status, chunks[0]);

    let header = Row::new(vec![
        Cell::from("Hop"),
        Cell::from("Host"),
        Cell::from("Loss%"),
        Cell::from("Avg"),
        Cell::from("Min"),
        Cell::from("Max"),
        Cell::from("Jttr"),
    ])
    .style(Style::default().fg(Color::Yellow));

    let rows: Vec<Row> = hops
        .iter()
        .map(|hop| {
            let host = match (&hop.hostname, hop.ip) {
                (Some(hostname), Some(ip)) => format!("{hostname} ({ip})"),
                (None, Some(ip)) => ip.to_string(),
                _ => "???".to_string(),
            };
            if hop.responded {
                Row::new(vec![
                    Cell::from(hop.hop.to_string()),
                    Cell::from(host),
                    Cell::from(format!("{:.1}", hop.loss_percent)),
                    Cell::from(format!("{:.1}", hop.avg_rtt_ms)),
                    Cell::from(format!("{:.1}", hop.min_rtt_ms)),
                    Cell::from(format!("{:.1}", hop.max_rtt_ms)),
                    Cell::from(format!("{:.1}", hop.jitter_ms)),
                ])
            } else {
                Row::new(vec![
                    Cell::from(hop.hop.to_string()),
                    Cell::from(host),
                    Cell::from("100.0"),
                    Cell::from("???"),
                    Cell::from("???"),
                    Cell::from("???"),
                    Cell::from("???"),
                ])
                .style(Style::default().fg(Color::DarkGray))
            }
        })
        .collect();

    let widths = [
        Constraint::Length(4),
        Constraint::Min(30),
        Constraint::Length(6),
        Constraint::Length(7),
        Constraint::Length(7),
        Constraint::Length(7),
        Constraint::Length(6),
    ];
    let table = Table::new(rows, widths).header(header);
    f.render_widget(table, chunks[1]);
}
