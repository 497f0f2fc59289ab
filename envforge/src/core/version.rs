//! Closest-version lookup over memory records.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::MemoryRecord;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+){0,2})").expect("version regex"));

/// Numeric components of the first `X[.Y[.Z]]` run in `raw`, padded to three.
pub fn parse_version(raw: &str) -> Option<[u64; 3]> {
    let found = VERSION_RE.find(raw)?;
    let mut parts = [0u64; 3];
    for (slot, piece) in parts.iter_mut().zip(found.as_str().split('.')) {
        *slot = piece.parse().ok()?;
    }
    Some(parts)
}

/// Pick the record to seed a new run for `repo` at `version`.
///
/// An exact version string match wins. Otherwise the highest parsed version
/// not above the target. Among equals the most recently appended record wins.
pub fn closest_record<'a>(
    records: &'a [MemoryRecord],
    repo: &str,
    version: &str,
) -> Option<&'a MemoryRecord> {
    let same_repo = || records.iter().filter(move |record| record.task.repo == repo);

    if let Some(exact) = same_repo()
        .filter(|record| record.task.version == version)
        .last()
    {
        return Some(exact);
    }

    let target = parse_version(version)?;
    let mut best: Option<(&MemoryRecord, [u64; 3])> = None;
    for record in same_repo() {
        let Some(candidate) = parse_version(&record.task.version) else {
            continue;
        };
        if candidate.cmp(&target) == Ordering::Greater {
            continue;
        }
        match best {
            Some((_, current)) if candidate < current => {}
            _ => best = Some((record, candidate)),
        }
    }
    best.map(|(record, _)| record)
}
