use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ActivityAction, ActivityId, LapId},
    error::ApiError,
};

/// Millisecond durations cross the wire as decimal strings so 64-bit values
/// survive JSON consumers that round large numbers to doubles.
pub mod ms_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<i64>()
            .map_err(|_| de::Error::custom(format!("invalid millisecond value: {raw}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapSummary {
    pub id: String,
    #[serde(with = "ms_string")]
    pub time: i64,
}

impl LapSummary {
    pub fn new(id: LapId, time: i64) -> Self {
        Self {
            id: id.0.to_string(),
            time,
        }
    }
}

/// Complete point-in-time state of one stopwatch. Self-sufficient: a client
/// can derive a live display from this alone, without further requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopwatchSnapshot {
    pub stopwatch_id: String,
    pub is_running: bool,
    pub start_time: DateTime<Utc>,
    #[serde(with = "ms_string")]
    pub elapsed_time: i64,
    /// Newest first. Each entry is the elapsed time at capture, relative to
    /// the run start, not a delta from the previous lap.
    pub laps: Vec<LapSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StopwatchCommand {
    Start,
    Pause,
    Lap {
        #[serde(rename = "currentTime")]
        current_time: i64,
    },
    Reset,
}

/// Who's-online entry. Purely observational; carries no authority over the
/// stopwatch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    pub id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub action: ActivityAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        id: ActivityId,
        action: ActivityAction,
        details: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.0.to_string(),
            action,
            details,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    StateUpdate(StopwatchSnapshot),
    ClientListUpdate(Vec<ConnectedClient>),
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Action(StopwatchCommand),
}
