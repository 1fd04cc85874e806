//! Cron expression evaluation.
//!
//! The public surface speaks classic 5-field POSIX cron
//! (`minute hour day-of-month month day-of-week`, UTC, seconds pinned to
//! `:00`). Evaluation is delegated to the `cron` crate, which wants a seconds
//! field and numbers days of the week 1-7; both differences are bridged here
//! so callers never see them.

use crate::error::CronError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Check an expression without evaluating it.
pub fn validate(expr: &str) -> Result<(), CronError> {
    build_schedule(expr).map(|_| ())
}

/// Smallest instant strictly after `reference` that matches `expr`.
///
/// Fails with `BadCron` when the expression never matches within the
/// schedule horizon (e.g. `0 0 30 2 *`).
pub fn next_after(expr: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let schedule = build_schedule(expr)?;
    schedule
        .after(&reference)
        .next()
        .ok_or_else(|| CronError::bad(expr, "no matching instant in the schedule horizon"))
}

fn build_schedule(expr: &str) -> Result<Schedule, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::bad(
            expr,
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }

    let day_of_week =
        rebase_day_of_week(fields[4]).map_err(|reason| CronError::bad(expr, reason))?;

    let with_seconds = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    );

    Schedule::from_str(&with_seconds).map_err(|err| CronError::bad(expr, err.to_string()))
}

/// Rewrite a POSIX day-of-week field (0-6, 0 and 7 both Sunday) into the
/// 1-7 numbering the `cron` crate expects. Named days pass through.
fn rebase_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let parts: Result<Vec<String>, String> = field.split(',').map(rebase_part).collect();
    Ok(parts?.join(","))
}

fn rebase_part(part: &str) -> Result<String, String> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };

    let rebased = if base == "*" {
        "*".to_string()
    } else if let Some((start, end)) = base.split_once('-') {
        format!("{}-{}", rebase_value(start)?, rebase_value(end)?)
    } else {
        rebase_value(base)?
    };

    Ok(match step {
        Some(step) => format!("{rebased}/{step}"),
        None => rebased,
    })
}

fn rebase_value(token: &str) -> Result<String, String> {
    match token.parse::<u8>() {
        Ok(n) if n <= 6 => Ok((n + 1).to_string()),
        Ok(7) => Ok("1".to_string()),
        Ok(n) => Err(format!("day-of-week value {n} out of range 0-7")),
        // Named days (MON, FRI, ...) are already 1-7 agnostic.
        Err(_) => Ok(token.to_string()),
    }
}
