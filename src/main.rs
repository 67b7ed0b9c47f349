use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use poros::args::{Args, Command};
use poros::trace::Tracer;
use poros::{config, report, ui};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("poros: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match &args.command {
        Some(Command::Version) => {
            println!("poros {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Config { init, show, path }) => {
            return run_config_command(*init, *show, *path, args.config.as_deref());
        }
        None => {}
    }

    let file = config::load(args.config.as_deref())?;
    let resolved = config::resolve(&args, &file)?;
    init_logging(resolved.verbose, resolved.tui);

    if resolved.tui {
        if let Some(trace) = ui::run_tui(&resolved).await? {
            println!("{}", report::render_summary(&trace, resolved.no_color));
            write_html(&resolved.html, &trace)?;
        }
        return Ok(());
    }

    let mut tracer = Tracer::new(resolved.trace.clone())?;
    let streaming = !resolved.json && !resolved.csv;
    if streaming {
        tracer = tracer.with_sink(Arc::new(report::StreamPrinter::new(resolved.no_color)));
        println!(
            "poros to {} ({} hops max, {} probes per hop, {})",
            resolved.target,
            resolved.trace.max_hops,
            resolved.trace.probe_count,
            resolved.trace.method.name(),
        );
    }

    let cancel = tracer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling trace");
            cancel.cancel();
        }
    });

    let trace = tracer.trace(&resolved.target).await?;

    if resolved.json {
        println!("{}", report::render_json(&trace)?);
    } else if resolved.csv {
        print!("{}", report::render_csv(&trace));
    } else {
        if resolved.verbose {
            println!();
            print!("{}", report::render_table(&trace));
        }
        println!("{}", report::render_summary(&trace, resolved.no_color));
    }
    write_html(&resolved.html, &trace)?;
    Ok(())
}

fn write_html(path: &Option<PathBuf>, trace: &poros::trace::TraceReport) -> anyhow::Result<()> {
    if let Some(path) = path {
        std::fs::write(path, report::render_html(trace))
            .with_context(|| format!("failed to write html report to {}", path.display()))?;
        eprintln!("wrote html report to {}", path.display());
    }
    Ok(())
}

fn init_logging(verbose: bool, tui: bool) {
    let default_filter = if verbose { "poros=debug" } else { "poros=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    if tui {
        // Logging must not disturb the terminal; append to a file instead.
        if let Ok(log_file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("poros.log")
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(log_file)
                .with_ansi(false)
                .init();
        }
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn run_config_command(
    init: bool,
    show: bool,
    path: bool,
    explicit: Option<&Path>,
) -> anyhow::Result<()> {
    if init {
        let target = match explicit {
            Some(path) => path.to_path_buf(),
            None => config::default_path().context("no user config directory available")?,
        };
        anyhow::ensure!(
            !target.exists(),
            "config file {} already exists",
            target.display()
        );
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, config::CONFIG_TEMPLATE)
            .with_context(|| format!("failed to write {}", target.display()))?;
        println!("wrote {}", target.display());
        return Ok(());
    }

    if show {
        let found = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => config::search_paths().into_iter().find(|p| p.is_file()),
        };
        match found {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                config::parse(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?;
                println!("# {}", path.display());
                print!("{text}");
            }
            None => println!("no config file found"),
        }
        return Ok(());
    }

    if path {
        for candidate in config::search_paths() {
            let marker = if candidate.is_file() { " (found)" } else { "" };
            println!("{}{marker}", candidate.display());
        }
        return Ok(());
    }

    anyhow::bail!("config requires one of --init, --show or --path");
}
