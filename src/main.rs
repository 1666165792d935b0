//! # Dataflow Runtime - Main Entry Point
//!
//! Boot sequence for one runtime process:
//!
//! 1. **Parse arguments**: runtime id, controller and listen addresses,
//!    operational knobs.
//! 2. **Initialize logging**: a colorized console layer plus an optional
//!    detailed layer to a file or stderr.
//! 3. **Build the runtime**: one [`Runtime`] value owns every table; no
//!    component reads globals.
//! 4. **Register built-in MSU types** and, when requested, apply a local
//!    DFG file.
//! 5. **Serve**: peer listener, stats ticker and the controller session
//!    run until the controller disconnects or the process is interrupted.
//!
//! A missing controller at startup is fatal configuration and exits
//! non-zero; everything after boot is the controller's decision.

use anyhow::{Context, Result};
use clap::Parser;
use dataflow_runtime::{
    cli::Args,
    dfg,
    runtime::{Runtime, RuntimeConfig},
};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ConsoleFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Verbosity: -q wins, then -v / -vv raise the floor.
    let log_level = if args.quiet {
        LevelFilter::WARN
    } else {
        match args.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    // Detailed layer (file or stderr); the guard must outlive the program
    // for the non-blocking writer to flush.
    let _log_guard;
    let detailed_layer = match args.log_file.as_deref() {
        Some("stderr") => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed(),
        ),
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            _log_guard = guard;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(log_level)
                    .boxed(),
            )
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .event_format(ConsoleFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(detailed_layer)
        .init();

    info!(
        "dataflow-runtime {} starting as runtime {}",
        dataflow_runtime::VERSION,
        args.runtime_id
    );

    let mut config = RuntimeConfig::new(args.runtime_id);
    config.listen_addr = Some(args.listen);
    config.controller_addr = Some(args.controller);
    config.queue_capacity = args.queue_capacity;
    config.www_dir = args.www_dir.clone();
    let runtime = Runtime::new(config);
    runtime
        .register_builtin_types()
        .context("registering built-in MSU types")?;

    // The stats sample log goes through its own non-blocking writer.
    let _stat_guard;
    if let Some(path) = &args.stat_log {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot open stat log {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        _stat_guard = guard;
        runtime.stats.set_writer(Box::new(writer));
    }

    // A local DFG file stands in for the controller's initial push.
    if let Some(path) = &args.dfg {
        let doc = dfg::load_dfg(path).with_context(|| format!("loading {}", path.display()))?;
        let summary = dfg::apply_dfg(&runtime, &doc).await?;
        info!(?summary, "applied local DFG");
    }

    let outcome = tokio::select! {
        result = runtime.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
            Ok(())
        }
    };

    let rt = std::sync::Arc::clone(&runtime);
    tokio::task::spawn_blocking(move || rt.shutdown()).await?;

    if let Err(err) = outcome {
        error!(%err, "runtime exited with error");
        return Err(err.into());
    }
    Ok(())
}
