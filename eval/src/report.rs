//! Aggregation of `status.json` records across task directories.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use envforge::core::types::{RunOutcome, StatusRecord};
use envforge::io::task_output::{RUN_META, RunMeta, STATUS, read_json};

use crate::task_dirs::load_task_dirs;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub runs: usize,
    pub finished: usize,
    pub exhausted: usize,
    pub aborted: usize,
    /// Runs per F2P classification; runs without one are not counted.
    pub classifications: BTreeMap<String, usize>,
    pub avg_elapsed_secs: Option<f64>,
    pub avg_iterations: Option<f64>,
}

pub fn aggregate(root: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut elapsed = Vec::new();
    let mut iterations = Vec::new();

    for dir in load_task_dirs(root)? {
        let status: StatusRecord = match read_json(&dir.join(STATUS)) {
            Ok(status) => status,
            Err(err) => {
                warnings.push(format!("skip {}: status.json invalid ({err:#})", dir.display()));
                continue;
            }
        };

        summary.runs += 1;
        match status.outcome {
            RunOutcome::Finished => summary.finished += 1,
            RunOutcome::Exhausted => summary.exhausted += 1,
            RunOutcome::Aborted => summary.aborted += 1,
        }
        if let Some(class) = status.f2p_classification {
            *summary.classifications.entry(class.to_string()).or_insert(0) += 1;
        }

        match read_json::<RunMeta>(&dir.join(RUN_META)) {
            Ok(meta) => {
                elapsed.push(meta.elapsed_secs);
                iterations.push(f64::from(meta.iterations));
            }
            Err(err) => warnings.push(format!("{}: run_meta.json invalid ({err:#})", dir.display())),
        }
    }

    summary.avg_elapsed_secs = mean(&elapsed);
    summary.avg_iterations = mean(&iterations);
    Ok((summary, warnings))
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration, Utc};
    use envforge::core::types::F2pClass;
    use envforge::io::task_output::write_json;

    use super::*;

    fn write_run(dir: &Path, outcome: RunOutcome, class: Option<F2pClass>, secs: i64, iterations: u32) {
        fs::create_dir_all(dir).expect("dir");
        let status = StatusRecord {
            is_finish: outcome == RunOutcome::Finished,
            f2p_classification: class,
            outcome,
            error: None,
        };
        write_json(&dir.join(STATUS), &status).expect("status");
        let start = Utc::now();
        let meta = RunMeta::new("t", start, start + Duration::seconds(secs), iterations, outcome);
        write_json(&dir.join(RUN_META), &meta).expect("meta");
    }

    #[test]
    fn aggregates_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_run(&temp.path().join("a"), RunOutcome::Finished, Some(F2pClass::Fail2Pass), 10, 1);
        write_run(&temp.path().join("b"), RunOutcome::Exhausted, Some(F2pClass::Pass2Pass), 30, 5);
        write_run(&temp.path().join("c"), RunOutcome::Aborted, None, 20, 3);
        fs::create_dir_all(temp.path().join("broken")).expect("broken");

        let (summary, warnings) = aggregate(temp.path()).expect("aggregate");
        assert_eq!(summary.runs, 3);
        assert_eq!((summary.finished, summary.exhausted, summary.aborted), (1, 1, 1));
        assert_eq!(summary.classifications.get("FAIL2PASS"), Some(&1));
        assert_eq!(summary.classifications.get("PASS2PASS"), Some(&1));
        assert_eq!(summary.avg_elapsed_secs, Some(20.0));
        assert_eq!(summary.avg_iterations, Some(3.0));
        assert_eq!(warnings.len(), 1);
    }
}
