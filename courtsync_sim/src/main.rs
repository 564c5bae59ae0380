//! CourtSync DST Simulator CLI
//!
//! Run deterministic session simulations under store fault scenarios.

use clap::Parser;
use courtsync_core::SyncConfig;
use courtsync_sim::scenarios::ScenarioId;
use courtsync_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// CourtSync Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "courtsync-sim")]
#[command(about = "Run deterministic session sync simulations for CourtSync", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of peers (max 9)
    #[arg(short, long, default_value = "4")]
    peers: usize,

    /// Scenario to run (steady_play, coordinator_crash, cascade_failover,
    /// lossy_store, high_latency, stalled_inbound, isolation,
    /// late_join_failover, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Play duration in seconds, before faults heal
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// JSON file overriding core tunables
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export simulation frames to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Frames between exported snapshots
    #[arg(long, default_value = "5")]
    export_interval: u64,
}

fn load_sync_config(path: Option<&str>) -> Result<SyncConfig, String> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
    SyncConfig::from_json(&json).map_err(|e| format!("invalid config {}: {}", path, e))
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("courtsync-sim {}", env!("CARGO_PKG_VERSION"));
    }

    let sync = load_sync_config(args.config.as_deref()).unwrap_or_else(|e| fail(&e));

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                fail(&format!("{} (available: {}, all)", e, names.join(", ")));
            }
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            fail("--export only supports a single scenario, not 'all'");
        }
        let scenario = scenarios[0];
        info!("Running with export to: {}", export_path);

        let runner = ScenarioRunner::new(base_seed, args.peers)
            .with_duration(args.duration)
            .with_sync(sync);
        let (result, export) = runner.run_recorded(scenario, args.export_interval);

        if let Err(e) = export.write_to_file(export_path) {
            error!("Failed to write export: {:?}", e);
        } else {
            info!("Exported {} frames to {}", export.frames.len(), export_path);
        }

        log_result(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    let mut results: Vec<ScenarioResult> = Vec::with_capacity(args.seeds * scenarios.len());
    for seed in (0..args.seeds as u64).map(|offset| base_seed.wrapping_add(offset)) {
        let runner = ScenarioRunner::new(seed, args.peers)
            .with_duration(args.duration)
            .with_sync(sync.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                log_result(&result);
            }
            results.push(result);
        }
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if args.json {
        print_json_summary(&results, failed);
    } else {
        info!("-----------------------------------------------------");
        if failed == 0 {
            info!("{} run(s), all passed", results.len());
        } else {
            error!("{} of {} run(s) failed:", failed, results.len());
            for result in results.iter().filter(|r| !r.passed) {
                error!(
                    "  {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}

fn log_result(result: &ScenarioResult) {
    let name = result.scenario.name();
    if result.passed {
        info!(
            "PASS {} seed={} | score {}-{} | epoch {} | watchdog {} | dropped reads {}",
            name,
            result.seed,
            result.metrics.score_team_a,
            result.metrics.score_team_b,
            result.metrics.final_epoch,
            result.metrics.watchdog_triggers,
            result.metrics.dropped_reads
        );
    } else {
        error!(
            "FAIL {} seed={}: {}",
            name,
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn print_json_summary(results: &[ScenarioResult], failed: usize) {
    let runs: Vec<serde_json::Value> = results
        .iter()
        .map(|r| {
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "ticks": r.total_ticks,
                "time_secs": r.final_time_secs,
                "peers": r.final_peer_count,
                "failure_reason": r.failure_reason,
                "metrics": r.metrics,
            })
        })
        .collect();
    let summary = serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": runs,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(&format!("cannot encode summary: {}", e)),
    }
}
