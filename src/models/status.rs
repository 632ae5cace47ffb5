// Status Models
// Health of each destination and of the local ingest

use serde::{Deserialize, Serialize};

/// Lifecycle state of one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationHealth {
    #[default]
    Idle,
    Connecting,
    Live,
    Retrying,
    Error,
}

/// Snapshot of one destination's health as seen by the supervisor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    pub id: String,
    pub health: DestinationHealth,
    /// Output bitrate in kbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Seconds since the first telemetry line of the current process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

impl DestinationStatus {
    pub fn idle(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn connecting(id: impl Into<String>, retry_count: u32) -> Self {
        Self {
            id: id.into(),
            health: DestinationHealth::Connecting,
            retry_count,
            ..Default::default()
        }
    }

    pub fn retrying(id: impl Into<String>, retry_count: u32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: DestinationHealth::Retrying,
            error: Some(message.into()),
            retry_count,
            ..Default::default()
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: DestinationHealth::Error,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// State of the inbound RTMP publish
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    /// Inbound bitrate in kbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_channels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Seconds since the publisher connected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
}

impl IngestStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_camel_case() {
        let status = DestinationStatus::retrying("d1", 2, "Disconnected (exit code 1). Retrying...");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["health"], "retrying");
        assert_eq!(json["retryCount"], 2);
        assert!(json.get("bitrate").is_none());
    }

    #[test]
    fn test_disconnected_ingest() {
        let json = serde_json::to_value(IngestStatus::disconnected()).unwrap();
        assert_eq!(json, serde_json::json!({ "connected": false }));
    }
}
