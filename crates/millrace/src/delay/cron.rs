//! Cron expression helpers for delay schedules.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

/// Accept standard five-field expressions by prepending a seconds field;
/// six- and seven-field expressions pass through unchanged.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

/// Next fire time for a cron expression evaluated in `timezone` (IANA
/// name; unknown names and `None` fall back to UTC).
///
/// Returns `None` when the expression is invalid or has no future ticks.
pub fn next_cron_fire(expression: &str, timezone: Option<&str>) -> Option<DateTime<Utc>> {
    let tz: Tz = match timezone {
        Some(name) => match name.parse() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = name, "unknown timezone, falling back to UTC");
                chrono_tz::UTC
            }
        },
        None => chrono_tz::UTC,
    };

    let normalized = normalize_cron(expression);
    let schedule = match Schedule::from_str(&normalized) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(expression, error = %e, "invalid cron expression");
            return None;
        }
    };

    let now = Utc::now().with_timezone(&tz);
    schedule.after(&now).next().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_five_field_expression() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  30 9 * * 1  "), "0 30 9 * * 1");
    }

    #[test]
    fn test_normalize_keeps_six_fields() {
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn test_next_fire_is_in_the_future() {
        let next = next_cron_fire("* * * * *", None).unwrap();
        assert!(next > Utc::now());
        // Every-minute schedule fires within the next minute.
        assert!(next <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        let utc = next_cron_fire("0 12 * * *", Some("UTC")).unwrap();
        let tokyo = next_cron_fire("0 12 * * *", Some("Asia/Tokyo")).unwrap();
        // Noon in Tokyo is 03:00 UTC; the two next-fire instants differ.
        assert_ne!(utc, tokyo);
    }

    #[test]
    fn test_invalid_expression_returns_none() {
        assert!(next_cron_fire("not a cron", None).is_none());
        assert!(next_cron_fire("99 99 * * *", None).is_none());
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let fallback = next_cron_fire("0 12 * * *", Some("Not/AZone")).unwrap();
        let utc = next_cron_fire("0 12 * * *", Some("UTC")).unwrap();
        assert_eq!(fallback, utc);
    }
}
