//! CONNECT identity payload.
//!
//! The MQTToT CONNECT carries a single zlib-compressed JSON document instead
//! of the usual client-id/username/password strings. Field order is fixed by
//! the struct declarations below.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::provider::{AuthInfo, DeviceInfo, Experiments, flags, settings};
use crate::topics::Topic;

pub const CLIENT_CAPABILITIES: u32 = 439;
pub const ENDPOINT_CAPABILITIES: u32 = 128;
pub const PUBLISH_FORMAT: u32 = 1;
pub const CLIENT_TYPE: &str = "cookie_auth";
pub const APP_ID: u64 = 567_067_343_352_427;
pub const CLIENT_STACK: u32 = 3;
pub const NETWORK_TYPE: u32 = 1;
pub const NETWORK_SUBTYPE: u32 = 0;
pub const MQTT_ROUTE: &str = "django";

/// Pubsub message types suppressed when the sync channel delivers them.
const IRIS_PUBSUB_BLACKLIST: &str = "direct, typing_type";

/// GraphQL subscription queries advertised at connect.
const EVERCLEAR_SUBSCRIPTIONS: [(&str, &str); 4] = [
    ("inapp_notification_subscribe_comment", "17899377895239777"),
    ("inapp_notification_subscribe_comment_mention_and_reply", "17899377895239777"),
    ("video_call_participant_state_delivery", "17977239895057311"),
    ("presence_subscribe", "17846944882223835"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectIdentity {
    pub client_identifier: String,
    pub client_info: ClientInfo,
    pub password: String,
    pub app_specific_info: AppSpecificInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub user_id: Value,
    pub user_agent: String,
    pub client_capabilities: u32,
    pub client_mqtt_session_id: u64,
    pub network_type: u32,
    pub network_subtype: u32,
    pub make_user_available_in_foreground: bool,
    pub is_initially_foreground: bool,
    pub no_automatic_foreground: bool,
    pub device_id: String,
    pub device_secret: String,
    pub endpoint_capabilities: u32,
    pub publish_format: u32,
    pub client_type: String,
    pub app_id: u64,
    pub subscribe_topics: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_preference: Option<String>,
    pub client_stack: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppSpecificInfo {
    pub platform: String,
    pub app_version: String,
    pub capabilities: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubsub_msg_type_blacklist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub everclear_subscriptions: Option<String>,
    pub user_agent: String,
    pub ig_mqtt_route: String,
    pub accept_language: String,
}

/// Topics the broker should push to this client from the moment it connects.
pub fn initial_subscribe_topics(experiments: &dyn Experiments) -> Vec<Topic> {
    let mut topics = vec![
        Topic::Pubsub,
        Topic::SendMessageResponse,
        Topic::RealtimeSub,
        Topic::Graphql,
    ];
    if flags::REGION_HINT.enabled(experiments) {
        topics.push(Topic::RegionHint);
    }
    if flags::IRIS.enabled(experiments) {
        topics.push(Topic::IrisSubResponse);
        topics.push(Topic::MessageSync);
    }
    topics
}

impl ConnectIdentity {
    /// Build the identity for one connect attempt. `options` carries the
    /// additional connect options (the `datacenter` preference).
    pub fn build(
        auth: &AuthInfo,
        device: &DeviceInfo,
        experiments: &dyn Experiments,
        options: &HashMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        let iris = flags::IRIS.enabled(experiments);
        let everclear = if flags::GRAPHQL_SUBSCRIPTIONS.enabled(experiments) {
            let map: BTreeMap<&str, &str> = EVERCLEAR_SUBSCRIPTIONS.into_iter().collect();
            Some(serde_json::to_string(&map)?)
        } else {
            None
        };

        Ok(Self {
            client_identifier: auth.client_identifier(),
            client_info: ClientInfo {
                user_id: numeric_or_string(&auth.user_id),
                user_agent: device.fb_user_agent.clone(),
                client_capabilities: CLIENT_CAPABILITIES,
                client_mqtt_session_id: session_id(),
                network_type: NETWORK_TYPE,
                network_subtype: NETWORK_SUBTYPE,
                make_user_available_in_foreground: false,
                is_initially_foreground: true,
                no_automatic_foreground: true,
                device_id: auth.device_id.clone(),
                device_secret: auth.device_secret.clone(),
                endpoint_capabilities: ENDPOINT_CAPABILITIES,
                publish_format: PUBLISH_FORMAT,
                client_type: CLIENT_TYPE.to_string(),
                app_id: APP_ID,
                subscribe_topics: initial_subscribe_topics(experiments)
                    .into_iter()
                    .map(Topic::wire_id)
                    .collect(),
                region_preference: options.get(settings::DATACENTER).cloned(),
                client_stack: CLIENT_STACK,
            },
            password: auth.password.clone(),
            app_specific_info: AppSpecificInfo {
                platform: device.platform.clone(),
                app_version: device.app_version.clone(),
                capabilities: device.capabilities.clone(),
                pubsub_msg_type_blacklist: iris.then(|| IRIS_PUBSUB_BLACKLIST.to_string()),
                everclear_subscriptions: everclear,
                user_agent: device.user_agent.clone(),
                ig_mqtt_route: MQTT_ROUTE.to_string(),
                accept_language: device.accept_language.clone(),
            },
        })
    }
}

fn numeric_or_string(id: &str) -> Value {
    id.parse::<u64>()
        .map_or_else(|_| Value::String(id.to_string()), Value::from)
}

fn session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticExperiments;

    fn auth() -> AuthInfo {
        AuthInfo {
            user_id: "25025320".into(),
            device_id: "2f4b0c1e-9a77-4d0e-8f1a-3c5d7e9f1b2a".into(),
            device_secret: String::new(),
            password: "sessionid=abc".into(),
            client_id: None,
        }
    }

    fn build(experiments: &StaticExperiments, options: &HashMap<String, String>) -> ConnectIdentity {
        ConnectIdentity::build(&auth(), &DeviceInfo::default(), experiments, options).unwrap()
    }

    #[test]
    fn field_order_is_fixed() {
        let identity = build(&StaticExperiments::default(), &HashMap::new());
        let text = serde_json::to_string(&identity).unwrap();
        let order = [
            "\"client_identifier\"",
            "\"client_info\"",
            "\"user_id\"",
            "\"user_agent\"",
            "\"client_capabilities\"",
            "\"client_mqtt_session_id\"",
            "\"device_id\"",
            "\"subscribe_topics\"",
            "\"client_stack\"",
            "\"password\"",
            "\"app_specific_info\"",
            "\"platform\"",
            "\"ig_mqtt_route\"",
            "\"accept_language\"",
        ];
        let positions: Vec<usize> = order.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
    }

    #[test]
    fn defaults_without_flags() {
        let identity = build(&StaticExperiments::default(), &HashMap::new());
        assert_eq!(identity.client_identifier, "2f4b0c1e-9a77-4d0e-8");
        assert_eq!(identity.client_info.user_id, Value::from(25_025_320u64));
        assert_eq!(identity.client_info.subscribe_topics, vec![88, 133, 149, 9]);
        assert!(identity.client_info.region_preference.is_none());

        let json = serde_json::to_value(&identity).unwrap();
        assert!(json["client_info"].get("region_preference").is_none());
        assert!(json["app_specific_info"].get("pubsub_msg_type_blacklist").is_none());
        assert!(json["app_specific_info"].get("everclear_subscriptions").is_none());
        assert_eq!(json["app_specific_info"]["ig_mqtt_route"], "django");
    }

    #[test]
    fn iris_and_region_flags() {
        let ex = StaticExperiments::default()
            .enable(flags::IRIS)
            .enable(flags::REGION_HINT)
            .enable(flags::GRAPHQL_SUBSCRIPTIONS);
        let options = HashMap::from([(settings::DATACENTER.to_string(), "ATN".to_string())]);
        let identity = build(&ex, &options);
        assert_eq!(
            identity.client_info.subscribe_topics,
            vec![88, 133, 149, 9, 150, 135, 146]
        );
        assert_eq!(identity.client_info.region_preference.as_deref(), Some("ATN"));
        assert_eq!(
            identity.app_specific_info.pubsub_msg_type_blacklist.as_deref(),
            Some("direct, typing_type")
        );
        let everclear: HashMap<String, String> = serde_json::from_str(
            identity.app_specific_info.everclear_subscriptions.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(everclear["presence_subscribe"], "17846944882223835");
    }

    #[test]
    fn non_numeric_user_id_stays_string() {
        assert_eq!(numeric_or_string("abc"), Value::from("abc"));
    }
}
