use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(LapId);
id_newtype!(ActivityId);

/// Key of a stopwatch record. Every call that touches persisted state takes
/// the key explicitly; nothing below the HTTP layer assumes a single tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StopwatchId(pub String);

impl StopwatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StopwatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    Start,
    Pause,
    Lap,
    Reset,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Start => "START",
            ActivityAction::Pause => "PAUSE",
            ActivityAction::Lap => "LAP",
            ActivityAction::Reset => "RESET",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "START" => Some(ActivityAction::Start),
            "PAUSE" => Some(ActivityAction::Pause),
            "LAP" => Some(ActivityAction::Lap),
            "RESET" => Some(ActivityAction::Reset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(StopwatchId::random(), StopwatchId::random());
    }

    #[test]
    fn activity_actions_round_trip_through_storage_form() {
        for action in [
            ActivityAction::Start,
            ActivityAction::Pause,
            ActivityAction::Lap,
            ActivityAction::Reset,
        ] {
            assert_eq!(ActivityAction::from_str(action.as_str()), Some(action));
        }
        assert_eq!(ActivityAction::from_str("REWIND"), None);
    }
}
