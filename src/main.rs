//! Binary entry point: CLI parsing, capture loop, shutdown, end-of-run
//! report. The statistical core lives in `manager`/`flow`/`dns`; this file
//! only wires collaborators together.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};

use dnsflow_meter::capture::{list_interfaces, PacketSource};
use dnsflow_meter::cli::Cli;
use dnsflow_meter::error::{CoreError, Result};
use dnsflow_meter::manager::FlowManager;
use dnsflow_meter::sinks::{CsvSink, HttpRowTransport, RemoteSink, Sink};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.list_interfaces {
        return match print_interfaces() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::FAILURE
            }
        };
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn print_interfaces() -> Result<()> {
    for (name, description, addrs) in list_interfaces()? {
        println!("{name}\t{description}\t{}", addrs.join(","));
    }
    Ok(())
}

fn build_sinks(cli: &Cli) -> Result<Vec<Box<dyn Sink>>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    sinks.push(Box::new(CsvSink::create(std::path::Path::new(&cli.output))?));

    if cli.wants_remote_sink() {
        let sheet_id = cli.remote_sheet_id.clone().ok_or_else(|| {
            CoreError::Config("-s <sheet-id> is required when -g is set".to_string())
        })?;
        let endpoint = cli
            .remote_creds
            .clone()
            .unwrap_or_else(|| "https://sheets.googleapis.com/v4/batchUpdate".to_string());
        let transport = HttpRowTransport::new(endpoint.clone(), sheet_id);
        sinks.push(Box::new(RemoteSink::new(Box::new(transport), endpoint.clone())));
        info!("remote sink enabled: {endpoint}");
    }

    Ok(sinks)
}

fn run(cli: Cli) -> Result<()> {
    let sinks = build_sinks(&cli)?;
    let mut manager = FlowManager::new(sinks, cli.label(), cli.flow_timeout_ms);

    let mut source = match (&cli.file, &cli.interface) {
        (Some(path), _) => PacketSource::open_file(path)?,
        (None, Some(iface)) => PacketSource::open_live(iface, cli.snaplen)?,
        (None, None) => {
            return Err(CoreError::Config(
                "one of -f <file> or -i <interface> is required".to_string(),
            ))
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        warn!("shutdown signal received, draining flow table");
        shutdown_handler.store(true, Ordering::SeqCst);
    })?;

    let wall_clock_start = Instant::now();
    let run_started_at = Utc::now();
    let mut first_packet_ms: Option<i64> = None;
    let mut last_packet_ms: Option<i64> = None;

    let loop_result = (|| -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match source.next_frame()? {
                Some((timestamp_ms, frame)) => {
                    first_packet_ms.get_or_insert(timestamp_ms);
                    last_packet_ms = Some(timestamp_ms);
                    manager.ingest(&frame, timestamp_ms);
                }
                None => break,
            }
        }
        Ok(())
    })();

    // §7: a fatal error after the manager is constructed still gets a
    // best-effort dump_all() via the shutdown path before the error
    // propagates to the entry point.
    manager.dump_all();
    loop_result?;

    let summary = RunSummary {
        counters: manager.counters(),
        first_packet_ms,
        last_packet_ms,
        run_started_at,
        wall_clock: wall_clock_start.elapsed(),
    };
    println!("{summary}");

    Ok(())
}

struct RunSummary {
    counters: dnsflow_meter::manager::RunCounters,
    first_packet_ms: Option<i64>,
    last_packet_ms: Option<i64>,
    run_started_at: chrono::DateTime<Utc>,
    wall_clock: std::time::Duration,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let skip_pct = if self.counters.total_packets == 0 {
            0.0
        } else {
            100.0 * self.counters.skipped_packets as f64 / self.counters.total_packets as f64
        };
        writeln!(f, "run started at {}", self.run_started_at.to_rfc3339())?;
        writeln!(f, "totalPackets: {}", self.counters.total_packets)?;
        writeln!(f, "skippedPackets: {} ({skip_pct:.2}%)", self.counters.skipped_packets)?;
        if let (Some(first), Some(last)) = (self.first_packet_ms, self.last_packet_ms) {
            writeln!(f, "capture span: {first} ms .. {last} ms")?;
        }
        write!(f, "wall-clock duration: {:.2}s", self.wall_clock.as_secs_f64())
    }
}
