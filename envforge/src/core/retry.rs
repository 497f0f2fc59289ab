//! Bounded retry shared by every generation step.

/// Run `op` up to `attempts` times until its output passes `validate`.
///
/// `op` receives the zero-based attempt index and the previous attempt's
/// error, so it can feed the failure back into the next prompt. On
/// exhaustion the last error is returned.
pub fn retry_bounded<T, E, Op, Validate>(
    attempts: u32,
    mut op: Op,
    mut validate: Validate,
) -> Result<T, E>
where
    Op: FnMut(u32, Option<&E>) -> Result<T, E>,
    Validate: FnMut(&T) -> Result<(), E>,
{
    let mut attempt_once = |attempt: u32, prev: Option<&E>| {
        op(attempt, prev).and_then(|value| {
            validate(&value)?;
            Ok(value)
        })
    };
    let mut result = attempt_once(0, None);
    for attempt in 1..attempts {
        match result {
            Ok(value) => return Ok(value),
            Err(err) => result = attempt_once(attempt, Some(&err)),
        }
    }
    result
}
