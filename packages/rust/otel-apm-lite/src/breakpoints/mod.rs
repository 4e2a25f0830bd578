//! Live breakpoints: descriptors served by the control plane, the process-wide
//! cache that holds them, location matching, and the background poller.

pub mod cache;
pub mod location;
pub mod poller;

pub use cache::BreakpointCache;
pub use location::LocationKey;
pub use poller::{snap_poll_interval, start_poller, PollerHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Breakpoint identifier. The control plane may send numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BreakpointId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointId::Numeric(id) => write!(f, "{}", id),
            BreakpointId::Text(id) => f.write_str(id),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A remotely managed code location eligible for snapshot capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointDescriptor {
    pub id: BreakpointId,
    pub service_name: String,
    pub file_path: String,
    pub line_number: u32,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_captures: u32,
    /// Server-side counter; the local copy is only as fresh as the last poll.
    #[serde(default)]
    pub capture_count: u32,
}

/// Why a resolved breakpoint refuses a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Disabled,
    Expired,
    LimitReached,
}

impl BreakpointDescriptor {
    /// Checks the enabled flag, expiry and capture limit at `now`.
    pub fn admits(&self, now: DateTime<Utc>) -> Result<(), Refusal> {
        if !self.enabled {
            return Err(Refusal::Disabled);
        }
        if self.expire_at.is_some_and(|expire_at| expire_at < now) {
            return Err(Refusal::Expired);
        }
        if self.max_captures > 0 && self.capture_count >= self.max_captures {
            return Err(Refusal::LimitReached);
        }
        Ok(())
    }
}

/// Response of `GET /sdk/snapshots/active/{service}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveBreakpoints {
    #[serde(default)]
    pub breakpoints: Vec<BreakpointDescriptor>,
}

/// Body of `POST /sdk/snapshots/auto-register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub service_name: String,
    pub file_path: String,
    pub line_number: u32,
    pub function_name: String,
    pub label: Option<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn descriptor(id: i64, function: &str, label: Option<&str>, file: &str, line: u32) -> BreakpointDescriptor {
        BreakpointDescriptor {
            id: BreakpointId::Numeric(id),
            service_name: "checkout".to_string(),
            file_path: file.to_string(),
            line_number: line,
            function_name: Some(function.to_string()),
            label: label.map(str::to_string),
            enabled: true,
            expire_at: None,
            max_captures: 0,
            capture_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use test_support::descriptor;

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let bp: BreakpointDescriptor = serde_json::from_value(json!({
            "id": 42,
            "service_name": "checkout",
            "file_path": "src/orders.rs",
            "line_number": 17,
            "function_name": "orders::create",
            "label": null
        }))
        .unwrap();
        assert_eq!(bp.id, BreakpointId::Numeric(42));
        assert!(bp.enabled);
        assert_eq!(bp.max_captures, 0);
        assert!(bp.expire_at.is_none());

        let bp: BreakpointDescriptor = serde_json::from_value(json!({
            "id": "bp_7",
            "service_name": "checkout",
            "file_path": "src/orders.rs",
            "line_number": 17,
            "enabled": false,
            "expire_at": "2030-01-01T00:00:00Z",
            "max_captures": 5,
            "capture_count": 2
        }))
        .unwrap();
        assert_eq!(bp.id.to_string(), "bp_7");
        assert!(!bp.enabled);
        assert_eq!(bp.expire_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_admits() {
        let now = Utc::now();
        let mut bp = descriptor(1, "f", None, "a.rs", 1);
        assert_eq!(bp.admits(now), Ok(()));

        bp.expire_at = Some(now - Duration::seconds(1));
        assert_eq!(bp.admits(now), Err(Refusal::Expired));
        bp.expire_at = Some(now + Duration::seconds(60));
        assert_eq!(bp.admits(now), Ok(()));

        bp.max_captures = 3;
        bp.capture_count = 3;
        assert_eq!(bp.admits(now), Err(Refusal::LimitReached));
        bp.capture_count = 2;
        assert_eq!(bp.admits(now), Ok(()));
        bp.max_captures = 0;
        bp.capture_count = 100;
        assert_eq!(bp.admits(now), Ok(()));

        bp.enabled = false;
        assert_eq!(bp.admits(now), Err(Refusal::Disabled));
    }
}
