//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use envforge::core::types::F2pClass;
use envforge::io::config::load_config;
use envforge::io::container::DockerCli;
use envforge::io::task_output::write_json;
use tracing::info;

use crate::judge::judge_all;
use crate::report::aggregate;
use crate::verify::verify_all;

/// Rebuild and rerun every generated environment under `root`.
pub fn verify(root: &Path, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let runtime = DockerCli::new(
        config.docker.binary.clone(),
        config.docker.platform.clone(),
        config.output_limit_bytes,
    );
    let results = verify_all(&runtime, &config, root).context("verify task directories")?;
    for result in &results {
        match &result.error {
            Some(error) => println!(
                "verify: task={} classification={} error={}",
                result.task_id,
                result.classification,
                error.lines().next().unwrap_or_default()
            ),
            None => println!("verify: task={} classification={}", result.task_id, result.classification),
        }
    }
    let passed = results
        .iter()
        .filter(|result| result.classification == F2pClass::Fail2Pass)
        .count();
    println!("verify: fail2pass={}/{}", passed, results.len());
    Ok(())
}

/// Classify saved logs without Docker and write the map to `output`.
pub fn judge(root: &Path, output: &Path) -> Result<()> {
    let results = judge_all(root)?;
    write_json(output, &results)?;
    info!(tasks = results.len(), output = %output.display(), "judgments written");
    println!("judge: tasks={} output={}", results.len(), output.display());
    Ok(())
}

/// Show aggregated run outcomes under `root`.
pub fn report(root: &Path) -> Result<()> {
    let (summary, warnings) = aggregate(root)?;
    println!("report: runs={}", summary.runs);
    println!(
        "report: finished={} exhausted={} aborted={}",
        summary.finished, summary.exhausted, summary.aborted
    );
    for (class, count) in &summary.classifications {
        println!("report: classification {} {}", class, count);
    }
    if let Some(avg) = summary.avg_elapsed_secs {
        println!("report: avg_elapsed_secs={:.2}", avg);
    }
    if let Some(avg) = summary.avg_iterations {
        println!("report: avg_iterations={:.2}", avg);
    }
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
