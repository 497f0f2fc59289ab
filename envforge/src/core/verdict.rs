//! Analyzer verdict parsing and validation.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::core::extract::extract_json;
use crate::core::types::{AnalysisVerdict, F2pClass, StageRole};
use crate::error::ForgeError;

pub const VERDICT_SCHEMA: &str = include_str!("../../schemas/analysis_verdict.schema.json");

static VERDICT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(VERDICT_SCHEMA).expect("verdict schema json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("verdict schema")
});

/// Parse analyzer output into a verdict.
///
/// The JSON may be fenced or surrounded by prose. It must match the verdict
/// schema, and a non-finishing verdict must carry at least one guidance text.
pub fn parse_verdict(text: &str) -> Result<AnalysisVerdict, ForgeError> {
    let mut value = extract_json(text)
        .map_err(|_| ForgeError::verdict("no JSON object in analyzer output"))?;
    normalize_keys(&mut value);
    validate_schema(&value)?;

    let is_finish = value
        .get("is_finish")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut guidance = BTreeMap::new();
    for role in StageRole::GUIDABLE {
        if let Some(text) = value.get(role.guidance_key()).and_then(Value::as_str)
            && !text.trim().is_empty()
        {
            guidance.insert(role, text.trim().to_string());
        }
    }
    if !is_finish && guidance.is_empty() {
        return Err(ForgeError::verdict(
            "is_finish is false but no stage received guidance",
        ));
    }
    Ok(AnalysisVerdict {
        is_finish,
        guidance,
    })
}

/// Reject a finishing verdict the test run does not back up.
///
/// With live execution a finish requires a FAIL2PASS run.
pub fn validate_finish(
    verdict: &AnalysisVerdict,
    classification: Option<F2pClass>,
    live_execution: bool,
) -> Result<(), ForgeError> {
    if !verdict.is_finish || !live_execution {
        return Ok(());
    }
    match classification {
        Some(F2pClass::Fail2Pass) => Ok(()),
        Some(other) => Err(ForgeError::verdict(format!(
            "is_finish claimed but the test run classified as {other}"
        ))),
        None => Err(ForgeError::verdict(
            "is_finish claimed but no test run completed",
        )),
    }
}

fn normalize_keys(value: &mut Value) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    if !map.contains_key("is_finish")
        && let Some(flag) = map.remove("isFinish")
    {
        map.insert("is_finish".to_string(), flag);
    }
}

fn validate_schema(instance: &Value) -> Result<(), ForgeError> {
    let messages: Vec<String> = VERDICT_VALIDATOR
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ForgeError::verdict(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}
