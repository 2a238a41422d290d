//! External collaborators: credentials, device strings, feature flags, and
//! persisted settings.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Session credentials supplied by the HTTP client after login.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_secret: String,
    /// Session cookie or token presented to the broker.
    pub password: String,
    /// Overrides the client identifier derived from `device_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl AuthInfo {
    /// MQTT client identifier: the explicit one if set, otherwise the first 20
    /// characters of the device id.
    pub fn client_identifier(&self) -> String {
        match &self.client_id {
            Some(id) => id.clone(),
            None => self.device_id.chars().take(20).collect(),
        }
    }
}

/// Strings describing the app build and device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// App user agent, sent in the app-specific section.
    pub user_agent: String,
    /// Analytics-style user agent, sent in the client-info section.
    pub fb_user_agent: String,
    pub app_version: String,
    /// Capabilities header value advertised by the app.
    pub capabilities: String,
    pub accept_language: String,
    pub platform: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            fb_user_agent: String::new(),
            app_version: String::new(),
            capabilities: String::new(),
            accept_language: "en-US".to_string(),
            platform: "android".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// Read-only view of server-side experiments.
pub trait Experiments: Send + Sync {
    fn is_enabled(&self, experiment: &str, param: &str) -> bool;
    fn get_param(&self, experiment: &str, param: &str, default: &str) -> String;
}

/// An `(experiment, param)` pair naming a boolean switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag {
    pub experiment: &'static str,
    pub param: &'static str,
}

impl Flag {
    pub fn enabled(self, experiments: &dyn Experiments) -> bool {
        experiments.is_enabled(self.experiment, self.param)
    }
}

pub mod flags {
    use super::Flag;

    /// Subscribe to live broadcast start/end notifications.
    pub const LIVE_EVENTS: Flag = Flag {
        experiment: "ig_android_skywalker_live_event_start_end",
        param: "is_enabled",
    };
    /// Subscribe to app presence updates.
    pub const APP_PRESENCE: Flag = Flag {
        experiment: "ig_android_direct_app_presence",
        param: "is_enabled",
    };
    /// Subscribe to zero-rating provisioning updates.
    pub const ZERO_PROVISION: Flag = Flag {
        experiment: "ig_android_zero_provision_realtime",
        param: "is_enabled",
    };
    /// Route direct traffic through the incremental sync channel.
    pub const IRIS: Flag = Flag {
        experiment: "ig_android_realtime_iris",
        param: "is_enabled",
    };
    /// Ask the broker for datacenter hints.
    pub const REGION_HINT: Flag = Flag {
        experiment: "ig_android_mqtt_region_hint",
        param: "is_enabled",
    };
    /// Allow reactions on direct items.
    pub const REACTIONS: Flag = Flag {
        experiment: "ig_android_direct_reactions",
        param: "is_enabled",
    };
    /// Advertise the additional GraphQL subscription queries at connect.
    pub const GRAPHQL_SUBSCRIPTIONS: Flag = Flag {
        experiment: "ig_android_realtime_graphql_subscriptions",
        param: "is_enabled",
    };
}

/// Map-backed experiments snapshot, typically deserialised from the sync
/// response the HTTP client stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticExperiments {
    pub experiments: HashMap<String, HashMap<String, String>>,
}

impl StaticExperiments {
    pub fn set(
        mut self,
        experiment: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.experiments
            .entry(experiment.into())
            .or_default()
            .insert(param.into(), value.into());
        self
    }

    pub fn enable(self, flag: Flag) -> Self {
        self.set(flag.experiment, flag.param, "true")
    }
}

impl Experiments for StaticExperiments {
    fn is_enabled(&self, experiment: &str, param: &str) -> bool {
        self.experiments
            .get(experiment)
            .and_then(|params| params.get(param))
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "enabled"))
    }

    fn get_param(&self, experiment: &str, param: &str, default: &str) -> String {
        self.experiments
            .get(experiment)
            .and_then(|params| params.get(param))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub mod settings {
    /// Last datacenter the broker hinted at.
    pub const DATACENTER: &str = "datacenter";
    /// `"true"` when presence has been switched off by the account owner.
    pub const PRESENCE_DISABLED: &str = "presence_disabled";
}

/// Key/value store persisted across restarts.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// Process-local settings; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_identifier_truncates_device_id() {
        let auth = AuthInfo {
            device_id: "2f4b0c1e-9a77-4d0e-8f1a-3c5d7e9f1b2a".into(),
            ..Default::default()
        };
        assert_eq!(auth.client_identifier(), "2f4b0c1e-9a77-4d0e-8");

        let auth = AuthInfo {
            client_id: Some("explicit".into()),
            ..auth
        };
        assert_eq!(auth.client_identifier(), "explicit");
    }

    #[test]
    fn static_experiments_lookup() {
        let ex = StaticExperiments::default()
            .enable(flags::IRIS)
            .set("ig_android_realtime_iris", "threshold", "5")
            .set("ig_android_direct_reactions", "is_enabled", "false");
        assert!(flags::IRIS.enabled(&ex));
        assert!(!flags::REACTIONS.enabled(&ex));
        assert!(!flags::LIVE_EVENTS.enabled(&ex));
        assert_eq!(ex.get_param("ig_android_realtime_iris", "threshold", "0"), "5");
        assert_eq!(ex.get_param("missing", "x", "dflt"), "dflt");
    }

    #[test]
    fn static_experiments_from_json() {
        let ex: StaticExperiments = serde_json::from_str(
            r#"{"ig_android_mqtt_region_hint": {"is_enabled": "Enabled"}}"#,
        )
        .unwrap();
        assert!(flags::REGION_HINT.enabled(&ex));
    }

    #[test]
    fn memory_settings_round_trip() {
        let store = MemorySettings::default().with(settings::DATACENTER, "dc1");
        assert_eq!(store.get(settings::DATACENTER).as_deref(), Some("dc1"));
        store.set(settings::DATACENTER, "dc2");
        assert_eq!(store.get(settings::DATACENTER).as_deref(), Some("dc2"));
        assert_eq!(store.get(settings::PRESENCE_DISABLED), None);
    }
}
