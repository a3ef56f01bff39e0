#![forbid(unsafe_code)]

use anyhow::Result;
use nudge_sim::oracle::ConsistencyOracle;
use nudge_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let mut simulator = Simulator::new(SimulationConfig::default())?;
    let result = simulator.run()?;
    let oracle = ConsistencyOracle::check_all(&result);

    println!(
        "simulation complete: steps={} records={} rejected_confirms={} races={} passed={}",
        result.trace.len(),
        result.store_len,
        result.rejected_confirms,
        result.races,
        oracle.passed
    );
    for violation in &oracle.violations {
        println!("  {violation}");
    }

    Ok(())
}
