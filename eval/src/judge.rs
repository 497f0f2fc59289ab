//! Offline F2P judgment from saved test logs.
//!
//! No container is involved: each task directory's pre-patch and post-patch
//! logs are scanned for the exit code marker and classified.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use envforge::core::classifier::{classify, extract_exit_code};
use envforge::core::types::F2pClass;
use envforge::io::harness::run_logs;
use envforge::io::task_output::read_optional;
use tracing::{debug, instrument};

use crate::task_dirs::{dir_name, load_task_dirs};

/// Classify one directory. Missing logs count as missing exit codes.
pub fn judge_dir(dir: &Path) -> Result<F2pClass> {
    let (pre_path, post_path) = run_logs(dir);
    let pre = read_optional(&pre_path)?.as_deref().and_then(extract_exit_code);
    let post = read_optional(&post_path)?.as_deref().and_then(extract_exit_code);
    Ok(classify(pre, post))
}

/// `{task_id: classification}` for every subdirectory of `root`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn judge_all(root: &Path) -> Result<BTreeMap<String, F2pClass>> {
    let mut results = BTreeMap::new();
    for dir in load_task_dirs(root)? {
        let class = judge_dir(&dir)?;
        debug!(task = %dir_name(&dir), %class, "judged");
        results.insert(dir_name(&dir), class);
    }
    Ok(results)
}
