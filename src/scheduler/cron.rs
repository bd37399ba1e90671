//! Five-field cron expression parsing, kept behind a thin wrapper so the
//! rest of the scheduler never touches the `cron` crate's types directly.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Rejects a malformed expression up front (spec §4.1: "Validates ...
/// cron_expression"), before a task row is ever written.
pub fn validate(expr: &str) -> Result<()> {
    Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| CoreError::InvalidInput(format!("invalid cron expression '{expr}': {e}")))
}

/// Next fire time strictly after `after`. Returns `Fatal` if the expression
/// was not validated at creation time and is now unparsable — that should be
/// unreachable in practice since [`validate`] runs on every write.
pub fn next_fire_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = Schedule::from_str(expr)
        .map_err(|e| CoreError::Fatal(format!("stored cron expression '{expr}' is invalid: {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| CoreError::Fatal(format!("cron expression '{expr}' has no future fire time")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_well_formed_expression() {
        assert!(validate("0 0 * * * *").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("not a cron expression").is_err());
    }

    #[test]
    fn next_fire_is_strictly_after_the_given_instant() {
        let now = Utc::now();
        let next = next_fire_after("0 * * * * *", now).unwrap();
        assert!(next > now);
    }
}
