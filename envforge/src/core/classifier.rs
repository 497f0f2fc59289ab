//! Fail-to-pass classification of two test runs.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::F2pClass;

/// Marker line every eval script prints after running its tests.
pub const EXIT_CODE_MARKER: &str = "OMNIGRIL_EXIT_CODE";

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OMNIGRIL_EXIT_CODE=(\d+)").expect("exit code regex"));

/// Classify a pre-patch / post-patch exit code pair. `0` is a pass.
pub fn classify(pre: Option<i32>, post: Option<i32>) -> F2pClass {
    match (pre, post) {
        (None, _) | (_, None) => F2pClass::Error,
        (Some(pre), Some(post)) => match (pre == 0, post == 0) {
            (false, true) => F2pClass::Fail2Pass,
            (true, true) => F2pClass::Pass2Pass,
            (false, false) => F2pClass::Fail2Fail,
            (true, false) => F2pClass::Pass2Fail,
        },
    }
}

/// Pull the exit code out of an eval script's output.
pub fn extract_exit_code(output: &str) -> Option<i32> {
    EXIT_CODE_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One-paragraph explanation handed to the analyzer with the test logs.
pub fn describe(class: F2pClass, pre: Option<i32>, post: Option<i32>) -> String {
    let codes = format!("pre-patch exit code: {pre:?}, post-patch exit code: {post:?}");
    let meaning = match class {
        F2pClass::Fail2Pass => {
            "Tests fail before the reference patch and pass after it. The environment reproduces the fix."
        }
        F2pClass::Pass2Pass => {
            "Tests pass both before and after the reference patch. The tests do not exercise the change."
        }
        F2pClass::Fail2Fail => {
            "Tests fail both before and after the reference patch. The environment or the tests are broken."
        }
        F2pClass::Pass2Fail => {
            "Tests pass before the reference patch and fail after it. The tests or the eval script are wrong."
        }
        F2pClass::Error => {
            "At least one run printed no exit code marker. The eval script did not run to completion."
        }
    };
    format!("F2P classification: {class} ({codes}). {meaning}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_every_pass_fail_pair() {
        assert_eq!(classify(Some(1), Some(0)), F2pClass::Fail2Pass);
        assert_eq!(classify(Some(0), Some(0)), F2pClass::Pass2Pass);
        assert_eq!(classify(Some(2), Some(1)), F2pClass::Fail2Fail);
        assert_eq!(classify(Some(0), Some(137)), F2pClass::Pass2Fail);
    }

    #[test]
    fn classify_missing_side_is_error() {
        for code in [None, Some(0), Some(1)] {
            assert_eq!(classify(None, code), F2pClass::Error);
            assert_eq!(classify(code, None), F2pClass::Error);
        }
    }

    #[test]
    fn first_exit_code_marker_wins() {
        let log = "OMNIGRIL_EXIT_CODE=2\nteardown\nOMNIGRIL_EXIT_CODE=0\n";
        assert_eq!(extract_exit_code(log), Some(2));
    }

    #[test]
    fn extract_exit_code_reads_marker() {
        let log = "running tests\n+ echo OMNIGRIL_EXIT_CODE=1\nOMNIGRIL_EXIT_CODE=1\n";
        assert_eq!(extract_exit_code(log), Some(1));
        assert_eq!(extract_exit_code("no marker here"), None);
    }

    #[test]
    fn describe_names_the_classification() {
        let text = describe(F2pClass::Fail2Fail, Some(1), Some(1));
        assert!(text.contains("FAIL2FAIL"));
    }
}
