//! Device identity and update session state

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::message::Envelope;
use crate::protocol::field;

/// Hardware family, reported as `dev_type` on every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Unknown,
    Flight,
    Airport,
    Ugv,
    GroundStation,
}

impl DeviceFamily {
    pub fn code(self) -> i64 {
        match self {
            DeviceFamily::Unknown => 0,
            DeviceFamily::Flight => 1,
            DeviceFamily::Airport => 2,
            DeviceFamily::Ugv => 3,
            DeviceFamily::GroundStation => 4,
        }
    }
}

impl Default for DeviceFamily {
    fn default() -> Self {
        DeviceFamily::Unknown
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: i64,
    pub family: DeviceFamily,
    pub model: String,
    pub serial: String,
    /// Derived from the installed version string, not stored with the identity.
    pub platform: String,
}

/// When firmware updates may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePolicy {
    Auto,
    Manual,
    All,
}

impl UpdatePolicy {
    pub fn code(self) -> i64 {
        match self {
            UpdatePolicy::Auto => 0,
            UpdatePolicy::Manual => 1,
            UpdatePolicy::All => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UpdatePolicy::Auto),
            1 => Some(UpdatePolicy::Manual),
            2 => Some(UpdatePolicy::All),
            _ => None,
        }
    }

    /// Accepts either the numeric code or the name.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let parsed = match value {
            Value::Number(n) => n.as_i64().and_then(Self::from_code),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| ProtocolError::InvalidField {
            field: field::POLICY,
            reason: format!("unknown policy {}", value),
        })
    }
}

impl FromStr for UpdatePolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Auto" => Ok(UpdatePolicy::Auto),
            "Manual" => Ok(UpdatePolicy::Manual),
            "All" => Ok(UpdatePolicy::All),
            other => Err(ProtocolError::InvalidField {
                field: field::POLICY,
                reason: format!("unknown policy {:?}", other),
            }),
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePolicy::Auto => "Auto",
            UpdatePolicy::Manual => "Manual",
            UpdatePolicy::All => "All",
        };
        f.write_str(name)
    }
}

/// Persisted update settings. Field names match the on-disk JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(rename = "Policy")]
    pub policy: UpdatePolicy,
    #[serde(rename = "Open Time")]
    pub open_hour: u8,
    #[serde(rename = "Close Time")]
    pub close_hour: u8,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            policy: UpdatePolicy::Auto,
            open_hour: 0,
            close_hour: 24,
        }
    }
}

pub const MAX_HOUR: f64 = 24.0;

/// Validate an hour of day from the wire. Fractions truncate.
pub fn parse_hour(field: &'static str, value: f64) -> Result<u8, ProtocolError> {
    if !(0.0..=MAX_HOUR).contains(&value) {
        return Err(ProtocolError::OutOfRange { field, value });
    }
    Ok(value.trunc() as u8)
}

/// Everything learned about the device at startup plus what the protocol
/// has changed since.
#[derive(Debug, Clone, Default)]
pub struct DeviceProfile {
    pub identity: DeviceIdentity,
    pub software_version: String,
    pub installation_path: String,
    pub update_config: UpdateConfig,
}

/// State owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    pub identity: DeviceIdentity,
    pub software_version: String,
    pub device_status: i64,
    pub update_config: UpdateConfig,
}

impl UpdateSession {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            identity: profile.identity,
            software_version: profile.software_version,
            device_status: 0,
            update_config: profile.update_config,
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.identity.id, self.identity.family.code())
    }

    pub fn identity_data(&self) -> Value {
        json!({
            field::MODEL: self.identity.model,
            field::PLATFORM: self.identity.platform,
        })
    }

    pub fn version_data(&self) -> Value {
        json!({ field::VERSION: self.software_version })
    }

    pub fn status_data(&self) -> Value {
        json!({ field::STATUS: self.device_status })
    }

    pub fn update_config_data(&self) -> Value {
        json!({
            field::POLICY: self.update_config.policy.code(),
            field::OPEN_TIME: self.update_config.open_hour,
            field::CLOSE_TIME: self.update_config.close_hour,
        })
    }
}

/// Platform is the part of the version string before the first '-'.
pub fn platform_from_version(version: &str) -> Option<&str> {
    version.split_once('-').map(|(platform, _)| platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_value() {
        assert_eq!(UpdatePolicy::from_value(&json!(0)).unwrap(), UpdatePolicy::Auto);
        assert_eq!(UpdatePolicy::from_value(&json!(2)).unwrap(), UpdatePolicy::All);
        assert_eq!(UpdatePolicy::from_value(&json!("Manual")).unwrap(), UpdatePolicy::Manual);
        assert!(UpdatePolicy::from_value(&json!(3)).is_err());
        assert!(UpdatePolicy::from_value(&json!(-1)).is_err());
        assert!(UpdatePolicy::from_value(&json!("auto")).is_err());
        assert!(UpdatePolicy::from_value(&json!(null)).is_err());
    }

    #[test]
    fn test_parse_hour_bounds() {
        assert_eq!(parse_hour("Open Time", 0.0).unwrap(), 0);
        assert_eq!(parse_hour("Open Time", 24.0).unwrap(), 24);
        assert_eq!(parse_hour("Open Time", 6.9).unwrap(), 6);
        assert!(parse_hour("Open Time", 24.5).is_err());
        assert!(parse_hour("Open Time", -0.5).is_err());
        assert!(parse_hour("Open Time", f64::NAN).is_err());
    }

    #[test]
    fn test_update_config_json_shape() {
        let cfg = UpdateConfig {
            policy: UpdatePolicy::Manual,
            open_hour: 6,
            close_hour: 22,
        };
        let text = serde_json::to_value(cfg).unwrap();
        assert_eq!(text, json!({"Policy": "Manual", "Open Time": 6, "Close Time": 22}));
        let back: UpdateConfig = serde_json::from_value(text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_session_reports() {
        let mut profile = DeviceProfile::default();
        profile.identity.id = 1024;
        profile.identity.family = DeviceFamily::Airport;
        profile.identity.model = "SM1B-A".into();
        profile.identity.platform = "TX2".into();
        let session = UpdateSession::new(profile);

        assert_eq!(session.envelope(), Envelope::new(1024, 2));
        assert_eq!(session.identity_data(), json!({"Model": "SM1B-A", "Platform": "TX2"}));
        assert_eq!(
            session.update_config_data(),
            json!({"Policy": 0, "Open Time": 0, "Close Time": 24})
        );
    }

    #[test]
    fn test_platform_from_version() {
        assert_eq!(platform_from_version("TX2-test-0301-7-g9b719e3"), Some("TX2"));
        assert_eq!(platform_from_version("noplatform"), None);
    }
}
