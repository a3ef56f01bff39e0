//! `nudge sim`: deterministic simulation campaign commands.
//!
//! `nudge sim run`: execute a campaign across many seeds.
//! `nudge sim replay`: replay a single seed with detailed trace output.

use std::io::Write;
use std::process;

use anyhow::Result;
use clap::{Args, Subcommand};
use nudge_sim::campaign::{self, CampaignConfig};
use serde::Serialize;

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

/// Failures listed before the output is truncated.
const FAILURE_SAMPLE: usize = 5;

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Execute deterministic simulation campaigns with configurable conversation\n\
                      counts, step counts, and fault rates. Reports pass/fail per seed and\n\
                      identifies the first failure for replay.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    nudge sim run --seeds 100\n\n\
                      # Hostile workload\n    nudge sim run --seeds 50 --duplicates 40 --confirm-failures 50\n\n\
                      # Machine-readable output\n    nudge sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    #[command(
        about = "Replay a single seed with detailed trace output",
        long_about = "Replay a specific seed to get its execution trace, oracle results,\n\
                      and violation details. Use after a campaign failure to debug.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    nudge sim replay --seed 42\n\n\
                      # Include every step\n    nudge sim replay --seed 42 --trace\n\n\
                      # Machine-readable output\n    nudge sim replay --seed 42 --format json"
    )]
    Replay(SimReplayArgs),
}

/// Workload knobs shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    /// Number of simulated conversations.
    #[arg(long, default_value = "4")]
    pub conversations: usize,

    /// Workload steps per seed.
    #[arg(long, default_value = "60")]
    pub steps: u64,

    /// Percent of deliveries repeated by the stream.
    #[arg(long, default_value = "15")]
    pub duplicates: u8,

    /// Percent of deliveries authored by the owner.
    #[arg(long, default_value = "10")]
    pub self_echo: u8,

    /// Percent of read-state confirms the store rejects.
    #[arg(long, default_value = "20")]
    pub confirm_failures: u8,

    /// Percent of steps that mark something read.
    #[arg(long, default_value = "30")]
    pub marks: u8,

    /// Percent of steps that clear, refresh, or resubscribe.
    #[arg(long, default_value = "10")]
    pub churn: u8,
}

impl WorkloadArgs {
    fn campaign_config(&self, seed_start: u64, seeds: u64) -> CampaignConfig {
        CampaignConfig {
            seed_range: seed_start..seed_start.saturating_add(seeds),
            conversations: self.conversations,
            steps: self.steps,
            duplicate_percent: self.duplicates,
            self_echo_percent: self.self_echo,
            confirm_failure_percent: self.confirm_failures,
            mark_percent: self.marks,
            churn_percent: self.churn,
        }
    }
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub workload: WorkloadArgs,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    pub seed: u64,

    /// Print every trace step.
    #[arg(long)]
    pub trace: bool,

    #[command(flatten)]
    pub workload: WorkloadArgs,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    steps: usize,
    ingest_attempts: u64,
    expected_attempts: u64,
    distinct_events: usize,
    store_len: usize,
    rejected_confirms: usize,
    races: usize,
    interesting_state_reached: bool,
    oracle_passed: bool,
    violations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<nudge_sim::TraceEvent>>,
}

/// Execute `nudge sim run`.
///
/// Exits with status 1 when any seed fails so campaigns can gate CI.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a simulation
/// cannot run.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = args.workload.campaign_config(args.seed_start, args.seeds);
    let report = campaign::run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "campaign seeds_run={} conversations={} steps={}",
                out.seeds_run, args.workload.conversations, args.workload.steps
            )?;
            writeln!(
                w,
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.interesting_states_reached, out.all_passed
            )?;
            for failure in out.failures.iter().take(FAILURE_SAMPLE) {
                writeln!(
                    w,
                    "failure seed={} violations={}",
                    failure.seed,
                    failure.violations.len()
                )?;
            }
            if let Some(seed) = out.first_failure {
                writeln!(w, "hint replay_seed={seed}")?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, "Simulation Campaign")?;
            pretty_kv(w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(w, "Convos", args.workload.conversations.to_string())?;
            pretty_kv(w, "Steps", args.workload.steps.to_string())?;
            pretty_kv(
                w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;
            match out.first_failure {
                None => pretty_kv(w, "Status", "all seeds passed")?,
                Some(seed) => {
                    pretty_kv(
                        w,
                        "Status",
                        format!("{} failures (first at seed {seed})", out.seeds_failed),
                    )?;
                    writeln!(w)?;
                    pretty_section(w, "Failure Samples")?;
                    for failure in out.failures.iter().take(FAILURE_SAMPLE) {
                        writeln!(w, "seed {:<8}", failure.seed)?;
                        for violation in &failure.violations {
                            writeln!(w, "  - {violation}")?;
                        }
                    }
                    if out.failures.len() > FAILURE_SAMPLE {
                        writeln!(w, "... and {} more", out.failures.len() - FAILURE_SAMPLE)?;
                    }
                    writeln!(w)?;
                    pretty_kv(w, "Replay", format!("nudge sim replay --seed {seed}"))?;
                }
            }
            Ok(())
        },
    )?;

    if !report.all_passed() {
        process::exit(1);
    }
    Ok(())
}

/// Execute `nudge sim replay`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the simulation
/// cannot run.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = args.workload.campaign_config(args.seed, 1);
    let detail = campaign::replay_seed(args.seed, &config)?;
    let result = detail.result;

    let out = ReplayOutput {
        seed: args.seed,
        steps: result.trace.len(),
        ingest_attempts: result.ingest_attempts,
        expected_attempts: result.expected_attempts,
        distinct_events: result.distinct_events,
        store_len: result.store_len,
        rejected_confirms: result.rejected_confirms,
        races: result.races,
        interesting_state_reached: result.interesting_state_reached,
        oracle_passed: detail.oracle.passed,
        violations: detail
            .oracle
            .violations
            .iter()
            .map(ToString::to_string)
            .collect(),
        trace: args.trace.then_some(result.trace),
    };

    render_mode(
        output,
        &out,
        |out, w| {
            writeln!(
                w,
                "replay seed={} steps={} oracle_passed={}",
                out.seed, out.steps, out.oracle_passed
            )?;
            writeln!(
                w,
                "result ingest_attempts={} expected_attempts={} distinct_events={} store_len={} rejected_confirms={} races={} interesting_state_reached={}",
                out.ingest_attempts,
                out.expected_attempts,
                out.distinct_events,
                out.store_len,
                out.rejected_confirms,
                out.races,
                out.interesting_state_reached
            )?;
            for violation in &out.violations {
                writeln!(w, "violation={violation}")?;
            }
            for event in out.trace.iter().flatten() {
                writeln!(w, "step={} {:?} -> {:?}", event.step, event.action, event.outcome)?;
            }
            Ok(())
        },
        |out, w| {
            pretty_section(w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(w, "Steps", out.steps.to_string())?;
            pretty_kv(
                w,
                "Ingested",
                format!("{} of {} expected", out.ingest_attempts, out.expected_attempts),
            )?;
            pretty_kv(
                w,
                "Stored",
                format!("{} of {} distinct", out.store_len, out.distinct_events),
            )?;
            pretty_kv(w, "Rejected", out.rejected_confirms.to_string())?;
            pretty_kv(w, "Races", out.races.to_string())?;
            pretty_kv(w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(w, "Oracle", out.oracle_passed.to_string())?;
            if !out.violations.is_empty() {
                writeln!(w)?;
                pretty_section(w, "Violations")?;
                for violation in &out.violations {
                    writeln!(w, "  - {violation}")?;
                }
            }
            if let Some(trace) = &out.trace {
                writeln!(w)?;
                pretty_section(w, "Trace")?;
                for event in trace {
                    writeln!(w, "{:>4}  {:?}", event.step, event.action)?;
                    writeln!(w, "      -> {:?}", event.outcome)?;
                }
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload() -> WorkloadArgs {
        WorkloadArgs {
            conversations: 3,
            steps: 20,
            duplicates: 10,
            self_echo: 5,
            confirm_failures: 25,
            marks: 30,
            churn: 5,
        }
    }

    #[test]
    fn campaign_config_maps_every_knob() {
        let config = workload().campaign_config(10, 5);
        assert_eq!(config.seed_range, 10..15);
        assert_eq!(config.conversations, 3);
        assert_eq!(config.steps, 20);
        assert_eq!(config.duplicate_percent, 10);
        assert_eq!(config.self_echo_percent, 5);
        assert_eq!(config.confirm_failure_percent, 25);
        assert_eq!(config.mark_percent, 30);
        assert_eq!(config.churn_percent, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn seed_range_saturates() {
        let config = workload().campaign_config(u64::MAX - 1, 10);
        assert_eq!(config.seed_range, (u64::MAX - 1)..u64::MAX);
    }
}
