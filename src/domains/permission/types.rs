use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;

/// A device-level capability a metric may require
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "scope", rename_all = "snake_case")]
pub enum Capability {
    Location,
    BackgroundLocation,
    Microphone,
    UsageStats,
    ActivityRecognition,
    /// Read access to one record type of a third-party health provider
    HealthData(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Location => write!(f, "location"),
            Capability::BackgroundLocation => write!(f, "background_location"),
            Capability::Microphone => write!(f, "microphone"),
            Capability::UsageStats => write!(f, "usage_stats"),
            Capability::ActivityRecognition => write!(f, "activity_recognition"),
            Capability::HealthData(scope) => write!(f, "health_data:{}", scope),
        }
    }
}

impl FromStr for Capability {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "location" => Ok(Capability::Location),
            "background_location" => Ok(Capability::BackgroundLocation),
            "microphone" => Ok(Capability::Microphone),
            "usage_stats" => Ok(Capability::UsageStats),
            "activity_recognition" => Ok(Capability::ActivityRecognition),
            other => match other.strip_prefix("health_data:") {
                Some(scope) if !scope.is_empty() => Ok(Capability::HealthData(scope.to_string())),
                _ => Err(ValidationError::invalid_value("capability", &format!("unknown capability '{}'", other))),
            },
        }
    }
}
