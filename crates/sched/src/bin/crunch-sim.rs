//! crunch-sim: run a scheduling scenario on a simulated clock.
//!
//! Loads a TOML scenario (host preferences plus a list of projects and how
//! their servers behave), runs the client scheduler against it, and prints
//! how each project's received wall time compares with its resource share.

use clap::Parser;
use tracing::info;

use crunch_core::config::{load_dotenv, Config};
use crunch_sched::sim::{HostSimulator, Scenario};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulate the client CPU scheduler and work fetch over a scenario.
#[derive(Parser, Debug)]
#[command(name = "crunch-sim", version, about)]
struct Cli {
    /// Path to the scenario TOML file.
    #[arg(long, env = "CRUNCH_SCENARIO", default_value = "scenarios/two-projects.toml")]
    scenario: String,

    /// Simulated hours to run.
    #[arg(long, default_value_t = 24.0)]
    hours: f64,

    /// Simulation step in seconds.
    #[arg(long, default_value_t = 60.0)]
    step_secs: f64,

    /// Take preferences and host settings from the environment instead of
    /// the scenario's `[config]` table.
    #[arg(long)]
    env_config: bool,

    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut scenario = Scenario::from_file(&cli.scenario)?;
    info!(path = %cli.scenario, projects = scenario.projects.len(), "loaded scenario");
    if cli.env_config {
        scenario.config = Config::from_env()?;
    }
    scenario.config.log_summary();

    let mut sim = HostSimulator::new(scenario)?;
    sim.run_for(cli.hours * 3_600.0, cli.step_secs)?;
    let report = sim.report();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{:<32} {:>8} {:>8} {:>10} {:>6} {:>7} {:>8}",
        "project", "share", "wall", "hours", "done", "missed", "fetches"
    );
    for p in &report.projects {
        println!(
            "{:<32} {:>7.1}% {:>7.1}% {:>10.1} {:>6} {:>7} {:>8}",
            p.project.as_str(),
            p.share_fraction * 100.0,
            p.wall_fraction * 100.0,
            p.total_wall_time / 3_600.0,
            p.counters.completed,
            p.counters.deadline_misses,
            p.counters.fetches,
        );
    }
    println!(
        "\n{:.1} h simulated, {} passes ({} in panic mode), {} epochs, {} preemptions",
        report.elapsed_hours,
        report.metrics.passes,
        report.metrics.panic_passes,
        report.metrics.epochs_closed,
        report.metrics.preemptions,
    );
    Ok(())
}
