//! clutchsim — Run Clutch scheduler simulations over built-in scenarios or
//! JSON workload files.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use clutch_sim::{
    build_engine, load_workload_json, parse_duration_us, parse_seed, scenario_profiles,
    seed_from_env, SimFormat, SCENARIO_NAMES,
};

/// Run Clutch scheduler simulations.
#[derive(Parser)]
#[command(name = "clutchsim")]
struct Cli {
    /// Built-in scenario to run.
    #[arg(default_value = "mixed")]
    scenario: String,

    /// Number of simulated CPUs.
    #[arg(short, long, default_value_t = 4)]
    cpus: u32,

    /// Simulation duration ("1s", "500ms", "100us", or bare µs).
    #[arg(short, long, default_value = "1s")]
    duration: String,

    /// PRNG seed (integer or "entropy"). Falls back to CLUTCH_SIM_SEED.
    #[arg(short, long)]
    seed: Option<String>,

    /// Load workloads from a JSON file instead of a built-in scenario.
    #[arg(long, value_name = "PATH")]
    workload: Option<PathBuf>,

    /// Print the event trace to stderr.
    #[arg(long)]
    trace: bool,

    /// Print the processor run-target switch timeline.
    #[arg(long)]
    switches: bool,

    /// Skip the summary statistics.
    #[arg(long)]
    no_stats: bool,

    /// Write the report and state snapshot as JSON to a file.
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,

    /// List available scenarios and exit.
    #[arg(long)]
    list_scenarios: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(&cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list_scenarios {
        for name in SCENARIO_NAMES {
            println!("{name}");
        }
        return Ok(());
    }

    let duration_us = parse_duration_us(&cli.duration)
        .with_context(|| format!("bad --duration {:?}", cli.duration))?;
    if duration_us == 0 {
        bail!("duration must be positive");
    }
    let seed = match &cli.seed {
        Some(s) => parse_seed(Some(s)),
        None => seed_from_env(),
    };

    let profiles = match &cli.workload {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            load_workload_json(&json)
                .with_context(|| format!("failed to parse workload {}", path.display()))?
        }
        None => scenario_profiles(&cli.scenario)?,
    };

    let mut engine = build_engine(&profiles, cli.cpus, seed)?;
    println!(
        "Running '{}': {} CPUs, {}ms, seed {seed}, {} threads",
        cli.scenario,
        cli.cpus,
        duration_us / 1000,
        engine.scheduler.threads.len()
    );
    engine.run(duration_us);

    if cli.trace {
        eprintln!("--- Event Trace ---");
        for line in engine.trace.recent_lines(200) {
            eprintln!("{line}");
        }
        let total = engine.trace.len();
        if total > 200 {
            eprintln!("... ({} more events)", total - 200);
        }
    }

    if cli.switches {
        println!("--- Processor Switch Timeline ---");
        for line in &engine.scheduler.switch_log {
            println!("{line}");
        }
    }

    if !cli.no_stats {
        engine.stats.print_summary();
    }

    if let Some(path) = &cli.json {
        #[derive(serde::Serialize)]
        struct Output {
            report: clutch_sim::stats::SimReport,
            snapshot: clutch_sim::Snapshot,
        }
        let output = Output {
            report: engine.stats.report(),
            snapshot: engine.snapshot(),
        };
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &output)?;
        println!("wrote JSON report to {}", path.display());
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .try_init();
}
