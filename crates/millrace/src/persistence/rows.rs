//! Row types shared between the command processor, the runner and the
//! background services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::reliability::RetryPolicy;

/// Status of one activity (the durable record of an action's attempts).
///
/// Transitions: `pending → running → {completed, failed, retrying}`,
/// `retrying → running`. `completed` and `failed` are terminal, modulo an
/// admin re-arm back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// Status of a scaling operation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingStatus {
    Pending,
    Synchronizing,
    Completed,
    Failed,
}

impl std::fmt::Display for ScalingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Synchronizing => write!(f, "synchronizing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ScalingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synchronizing" => Ok(Self::Synchronizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown scaling status: {other}")),
        }
    }
}

/// One row of the event log.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub global_seq: i64,
    pub workflow_id: String,
    pub workflow_version: i64,
    pub event_type: String,
    pub workflow_type: String,
    pub schema_version: i32,
    pub body: serde_json::Value,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub published: bool,
}

impl EventRow {
    pub fn from_pg(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            global_seq: row.try_get("global_seq")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            event_type: row.try_get("event_type")?,
            workflow_type: row.try_get("workflow_type")?,
            schema_version: row.try_get("schema_version")?,
            body: row.try_get("body")?,
            at: row.try_get("at")?,
            metadata: row.try_get("metadata")?,
            published: row.try_get("published")?,
        })
    }

    pub fn metadata_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.metadata.as_object().cloned().unwrap_or_default()
    }
}

/// One activity row.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub workflow_id: String,
    pub event_number: i64,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub checkpoint: serde_json::Map<String, serde_json::Value>,
    pub retry_policy: RetryPolicy,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub resulting_command: Option<serde_json::Value>,
    pub runner_id: Option<String>,
}

impl ActivityRow {
    pub fn from_pg(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        let checkpoint: serde_json::Value = row.try_get("checkpoint")?;
        let retry_policy: serde_json::Value = row.try_get("retry_policy")?;
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            event_number: row.try_get("event_number")?,
            status,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            retry_count: row.try_get("retry_count")?,
            checkpoint: checkpoint.as_object().cloned().unwrap_or_default(),
            retry_policy: serde_json::from_value(retry_policy)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            error_type: row.try_get("error_type")?,
            error_message: row.try_get("error_message")?,
            resulting_command: row.try_get("resulting_command")?,
            runner_id: row.try_get("runner_id")?,
        })
    }
}

/// One delay schedule row.
#[derive(Debug, Clone)]
pub struct DelayScheduleRow {
    pub workflow_id: String,
    pub delay_id: String,
    pub workflow_type: String,
    pub fire_at: DateTime<Utc>,
    pub event_version: i64,
    pub next_command: serde_json::Value,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
}

impl DelayScheduleRow {
    pub fn from_pg(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            delay_id: row.try_get("delay_id")?,
            workflow_type: row.try_get("workflow_type")?,
            fire_at: row.try_get("fire_at")?,
            event_version: row.try_get("event_version")?,
            next_command: row.try_get("next_command")?,
            cron_expression: row.try_get("cron_expression")?,
            timezone: row.try_get("timezone")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_status_round_trip() {
        for status in [
            ActionStatus::Pending,
            ActionStatus::Running,
            ActionStatus::Completed,
            ActionStatus::Failed,
            ActionStatus::Retrying,
        ] {
            let parsed: ActionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ActionStatus>().is_err());
    }

    #[test]
    fn test_scaling_status_round_trip() {
        for status in [
            ScalingStatus::Pending,
            ScalingStatus::Synchronizing,
            ScalingStatus::Completed,
            ScalingStatus::Failed,
        ] {
            let parsed: ScalingStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
