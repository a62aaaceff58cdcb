//! Companion utility for the ddctune engine: exercise it against simulated
//! displays, render persisted statistics, and manage the cache file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use ddctune_cache::{default_stats_path, load_registry, save_registry, CacheError};
use ddctune_clock::{FakeHostClock, SleepClock};
use ddctune_core::{
    DisplayReport, Engine, EngineConfig, EngineReport, ReportDepth, SimTransport,
};
use ddctune_types::{BusPath, Transport};

#[derive(Parser)]
#[command(name = "ddctune", version, about = "Adaptive DDC/MCCS retry and sleep tuning")]
struct Cli {
    /// Stats cache file; defaults to the per-user XDG location.
    #[arg(long, global = true)]
    cache_file: Option<PathBuf>,

    /// Base sleep multiplier applied before adaptive tuning.
    #[arg(long, default_value_t = 1.0)]
    multiplier: f64,

    /// Disable the dynamic sleep adaptor.
    #[arg(long)]
    no_dsa: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run retry loops against simulated flaky displays (virtual time, so
    /// this finishes instantly regardless of loop count).
    Simulate(SimulateArgs),
    /// Render per-display statistics from the cache file.
    Stats(StatsArgs),
    /// Inspect or remove the persisted state.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of simulated displays, attached as i2c-3, i2c-4, ...
    #[arg(long, default_value_t = 2)]
    displays: u16,

    /// Retry loops to run per display.
    #[arg(long, default_value_t = 50)]
    loops: u32,

    /// Probability that a simulated transaction fails with a retryable error.
    #[arg(long, default_value_t = 0.1)]
    error_rate: f64,

    /// Seed for the simulated failure pattern.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Persist the learned state to the cache file afterwards.
    #[arg(long)]
    save: bool,
}

#[derive(Args)]
struct StatsArgs {
    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Report depth: 0 summary, 1 per-class histograms, 2 raw history.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
    depth: u8,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Print the raw cache file.
    Show,
    /// Print the resolved cache file path.
    Path,
    /// Delete the cache file.
    Erase,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !cli.multiplier.is_finite() || cli.multiplier < 0.0 {
        anyhow::bail!("--multiplier must be a finite non-negative number");
    }

    let stats_path = match &cli.cache_file {
        Some(path) => path.clone(),
        None => default_stats_path().context("resolving cache path")?,
    };

    match &cli.command {
        Command::Simulate(args) => simulate(&cli, args, &stats_path),
        Command::Stats(args) => stats(&cli, args, &stats_path),
        Command::Cache { command } => cache(command, &stats_path),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(cli: &Cli) -> Engine {
    Engine::with_clock(
        EngineConfig {
            user_multiplier: cli.multiplier,
            dsa_enabled: !cli.no_dsa,
            ..EngineConfig::default()
        },
        // Virtual time: the CLI never has real hardware to pace.
        SleepClock::new(Arc::new(FakeHostClock::new(0))),
    )
}

fn report_depth(depth: u8) -> ReportDepth {
    match depth {
        0 => ReportDepth::Summary,
        1 => ReportDepth::Classes,
        _ => ReportDepth::Full,
    }
}

fn load_cache_lenient(engine: &Engine, path: &std::path::Path) {
    match load_registry(path, engine.registry(), &engine.record_defaults()) {
        Ok(count) => {
            if count > 0 {
                tracing::info!(count, "restored per-display records from cache");
            }
        }
        // Cache trouble never aborts; carry on with defaults.
        Err(CacheError::BadData { path, causes }) => {
            eprintln!("warning: discarding corrupt stats file {}", path.display());
            for cause in causes {
                eprintln!("warning:   {cause}");
            }
        }
        Err(err) => eprintln!("warning: {err:#}"),
    }
}

fn simulate(cli: &Cli, args: &SimulateArgs, stats_path: &std::path::Path) -> Result<()> {
    let engine = build_engine(cli);
    load_cache_lenient(&engine, stats_path);

    let mut sim = SimTransport::new(args.seed).with_error_rate(args.error_rate);
    let buses: Vec<BusPath> = (0..args.displays)
        .map(|i| BusPath::new(3 + i))
        .collect();
    for &bus in &buses {
        // Derive a stable fake EDID checksum from the bus number.
        sim.add_display(bus, 0x40 ^ bus.number() as u8);
    }

    let attached = engine.redetect(&mut sim, &buses);
    println!(
        "attached {attached} simulated display(s), error rate {:.0}%",
        args.error_rate * 100.0
    );

    let mut ok = 0u64;
    let mut failed = 0u64;
    for &bus in &buses {
        let record = engine
            .registry()
            .get(bus)
            .expect("redetect attached this bus");
        let mut handle = sim
            .open(bus, false)
            .context("opening simulated display")?;
        for _ in 0..args.loops {
            match engine.write_read_with_retry(&mut sim, &mut handle, &record, &[0x01, 0x10], 8)
            {
                Ok(_) => ok += 1,
                Err(err) => {
                    failed += 1;
                    tracing::info!(%bus, error = %err, "loop failed");
                }
            }
        }
        sim.close(handle).ok();

        let r = record.lock().expect("record lock poisoned");
        println!(
            "{bus}: step {} (x{:.2}), {} up / {} down, {} retryable failures",
            r.cur_step(),
            ddctune_types::step_to_multiplier(r.cur_step()),
            r.adjustments_up(),
            r.adjustments_down(),
            r.retryable_failures(),
        );
    }

    let sleep = engine.clock().stats();
    println!(
        "{ok} loops ok, {failed} failed; {} sleeps totalling {} virtual ms",
        sleep.total_calls, sleep.requested_millis
    );

    if args.save {
        let saved = save_registry(stats_path, engine.registry()).context("saving stats file")?;
        println!("saved {saved} record(s) to {}", stats_path.display());
    }
    Ok(())
}

fn stats(cli: &Cli, args: &StatsArgs, stats_path: &std::path::Path) -> Result<()> {
    let engine = build_engine(cli);
    load_cache_lenient(&engine, stats_path);

    let report = engine.report_all(report_depth(args.depth));
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_engine_report(&report);
    }
    Ok(())
}

fn cache(command: &CacheCommand, stats_path: &std::path::Path) -> Result<()> {
    match command {
        CacheCommand::Show => {
            match std::fs::read_to_string(stats_path) {
                Ok(contents) => print!("{contents}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    println!("no stats file at {}", stats_path.display());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reading {}", stats_path.display()))
                }
            }
            Ok(())
        }
        CacheCommand::Path => {
            println!("{}", stats_path.display());
            Ok(())
        }
        CacheCommand::Erase => {
            match std::fs::remove_file(stats_path) {
                Ok(()) => println!("removed {}", stats_path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    println!("no stats file at {}", stats_path.display());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing {}", stats_path.display()))
                }
            }
            Ok(())
        }
    }
}

fn render_engine_report(report: &EngineReport) {
    println!(
        "dsa: {}   sleeps: {} calls, {} ms requested",
        if report.dsa_enabled { "enabled" } else { "disabled" },
        report.sleep.total_calls,
        report.sleep.requested_millis,
    );
    if report.displays.is_empty() {
        println!("no displays recorded");
        return;
    }
    for display in &report.displays {
        render_display_report(display);
    }
}

fn render_display_report(report: &DisplayReport) {
    println!();
    println!(
        "{}  (edid check {:02x}{}{})",
        report.bus,
        report.edid_check,
        if report.from_cache { ", cached" } else { "" },
        if report.edid_verified { ", verified" } else { "" },
    );
    println!(
        "  multiplier: user {:.2} ({}), initial x{:.2}, current x{:.2} (step {})",
        report.user_multiplier,
        report.user_multiplier_source,
        report.initial_multiplier,
        report.current_multiplier,
        report.cur_step,
    );
    println!(
        "  floor: step {}{}   lookback {}   interval {}",
        report.min_ok_step,
        if report.found_failure_step {
            " (failure step found)"
        } else {
            ""
        },
        report.lookback,
        report.remaining_interval,
    );
    println!(
        "  observations: {} ok, {} retryable failures, {} up / {} down, {} ms asleep",
        report.successful_observations,
        report.retryable_failures,
        report.adjustments_up,
        report.adjustments_down,
        report.total_sleep_millis,
    );
    if let (Some(min), Some(max), Some(avg)) = (
        report.ok_multiplier_min,
        report.ok_multiplier_max,
        report.ok_multiplier_avg,
    ) {
        println!("  ok multiplier: min x{min:.2}, max x{max:.2}, avg x{avg:.2}");
    }
    if let Some(classes) = &report.classes {
        for class in classes {
            if class.total_loops == 0 {
                continue;
            }
            println!(
                "  {}: budget {} (ever {}..{}), {} loops, histogram {:?}",
                class.class,
                class.max_tries,
                class.lowest_ever,
                class.highest_ever,
                class.total_loops,
                class.histogram,
            );
        }
    }
    if let Some(recent) = &report.recent {
        if !recent.is_empty() {
            let entries: Vec<String> = recent
                .iter()
                .map(|r| format!("{},{},{}", r.epoch_seconds, r.try_count, r.required_step))
                .collect();
            println!("  recent: {}", entries.join(" "));
        }
    }
}
