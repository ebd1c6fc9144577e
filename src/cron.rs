//! Cron expression handling.
//!
//! The parser itself is delegated to the `cron` crate; the engine only needs
//! "given this instant, when is the next fire time?".

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;

/// A parsed cron expression paired with its source text.
#[derive(Debug, Clone)]
pub struct CronExpression {
    expression: String,
    schedule: ::cron::Schedule,
}

impl CronExpression {
    /// Parse a six-or-seven-field cron expression (seconds first).
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let schedule =
            ::cron::Schedule::from_str(expression).map_err(|e| SchedulerError::CronParse {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// The first fire time strictly after `from`, or `None` when the
    /// expression cannot produce one.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_six_field_expression() {
        let expr = CronExpression::parse("0 */5 * * * *").unwrap();
        assert_eq!(expr.as_str(), "0 */5 * * * *");
    }

    #[test]
    fn rejects_garbage() {
        let err = CronExpression::parse("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::CronParse { .. }));
    }

    #[test]
    fn next_after_five_minute_boundary() {
        let expr = CronExpression::parse("0 */5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = expr.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());

        let after = expr.next_after(next).unwrap();
        assert_eq!(after, Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap());
    }

    #[test]
    fn next_after_is_strictly_after() {
        let expr = CronExpression::parse("0 0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let next = expr.next_after(on_the_hour).unwrap();
        assert!(next > on_the_hour);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn unreachable_expression_yields_none() {
        // February 30th never exists.
        let expr = CronExpression::parse("0 0 0 30 2 *").unwrap();
        assert!(expr.next_after(Utc::now()).is_none());
    }
}
