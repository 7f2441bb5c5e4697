use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Platform error code reported when the device's credentials are no longer valid.
pub const NOT_AUTHORIZED_CODE: i64 = 3010;

/// Persisted device identity. Unknown platform fields ride along in `extra`
/// so the identity file round-trips verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceIdentity {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceToken", default)]
    pub device_token: String,
    #[serde(rename = "directUrl", default, skip_serializing_if = "Option::is_none")]
    pub direct_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceIdentity {
    pub fn from_value(value: Value) -> Option<Self> {
        let identity: DeviceIdentity = serde_json::from_value(value).ok()?;
        if identity.device_id.trim().is_empty() {
            return None;
        }
        Some(identity)
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Overlays `update` on top of this identity. Fields absent from the
    /// update keep their current value.
    pub fn merged_with(&self, update: &Map<String, Value>) -> Option<Self> {
        let mut merged = self.to_map();
        for (key, value) in update {
            merged.insert(key.clone(), value.clone());
        }
        Self::from_value(Value::Object(merged))
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.extra.get("streamUrl").and_then(Value::as_str)
    }
}

/// `{ "error": { "code": ..., "message": ... } }` as returned by the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn from_message(value: &Value) -> Option<Self> {
        let error = value.get("error")?;
        if !error.is_object() {
            return None;
        }
        let code = match error.get("code") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self { code, message })
    }

    pub fn is_not_authorized(&self) -> bool {
        self.code == Some(NOT_AUTHORIZED_CODE)
    }
}

/// Parses an inbound frame. Malformed JSON becomes an error object rather
/// than a fault so it can flow through normal dispatch.
pub fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|err: serde_json::Error| {
        serde_json::json!({ "error": { "message": err.to_string() } })
    })
}

/// Partial-match predicate over JSON objects.
///
/// An element matches when every key present in both the element and the
/// selector carries an equal value, and at least one such key exists.
/// Selector keys the element lacks are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    constraints: Vec<FieldConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldConstraint {
    pub key: String,
    pub value: Value,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.push(FieldConstraint {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            constraints: map
                .iter()
                .map(|(key, value)| FieldConstraint {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn matches(&self, element: &Map<String, Value>) -> bool {
        let mut shared = 0usize;
        for constraint in &self.constraints {
            if let Some(value) = element.get(&constraint.key) {
                if *value != constraint.value {
                    return false;
                }
                shared += 1;
            }
        }
        shared > 0
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.constraints
            .iter()
            .map(|c| (c.key.clone(), c.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SceneTriggerSet {
    #[serde(default)]
    pub devices: Vec<TriggerDevice>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(rename = "localDirectUrls", default)]
    pub local_direct_urls: Vec<String>,
}

impl SceneTriggerSet {
    pub fn scene(&self, scene_id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.scene_id == scene_id)
    }

    pub fn device_for(&self, selector: &Selector) -> Option<&TriggerDevice> {
        self.devices.iter().find(|d| selector.matches(&d.fields))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TriggerDevice {
    #[serde(default)]
    pub actions: Vec<TriggerAction>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TriggerDevice {
    pub fn action_for(&self, selector: &Selector) -> Option<&TriggerAction> {
        self.actions.iter().find(|a| selector.matches(&a.fields))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TriggerAction {
    #[serde(default)]
    pub scenes: Vec<SceneRef>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Candidate scene reference: either a bare id or an object naming `sceneId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SceneRef {
    Id(String),
    Object {
        #[serde(rename = "sceneId")]
        scene_id: String,
    },
}

impl SceneRef {
    pub fn scene_id(&self) -> &str {
        match self {
            SceneRef::Id(id) => id,
            SceneRef::Object { scene_id } => scene_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Scene {
    #[serde(rename = "sceneId")]
    pub scene_id: String,
    #[serde(rename = "roomId", default)]
    pub room_id: String,
    #[serde(default)]
    pub level: f64,
    #[serde(default)]
    pub commands: Vec<Value>,
}

impl Scene {
    pub fn is_off(&self) -> bool {
        self.level == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parse_message_keeps_valid_json() {
        let parsed = parse_message(r#"{"number":5,"string":"test string","array":[]}"#);
        assert_eq!(parsed, json!({"number": 5, "string": "test string", "array": []}));
    }

    #[test]
    fn parse_message_wraps_invalid_json_in_error_object() {
        let parsed = parse_message(r#"{"this": is broken JSON"#);
        let message = parsed["error"]["message"].as_str().unwrap();
        assert!(!message.is_empty());
        assert!(parsed["error"].get("code").is_none());
    }

    #[test]
    fn identity_round_trips_extra_fields() {
        let raw = json!({"deviceId": "d1", "deviceToken": "t1", "roomId": "r9", "nested": {"a": 1}});
        let identity = DeviceIdentity::from_value(raw.clone()).unwrap();
        assert_eq!(identity.device_id, "d1");
        assert_eq!(serde_json::to_value(&identity).unwrap(), raw);
    }

    #[test]
    fn identity_without_device_id_is_rejected() {
        assert!(DeviceIdentity::from_value(json!({"deviceToken": "t1"})).is_none());
        assert!(DeviceIdentity::from_value(json!({"deviceId": "", "deviceToken": "t1"})).is_none());
        assert!(DeviceIdentity::from_value(json!([1, 2])).is_none());
    }

    #[test]
    fn merge_keeps_fields_absent_from_update() {
        let identity = DeviceIdentity::from_value(json!({
            "deviceId": "d1", "deviceToken": "t1", "name": "Widget"
        }))
        .unwrap();
        let merged = identity
            .merged_with(&object(json!({"deviceToken": "t2"})))
            .unwrap();
        assert_eq!(merged.device_token, "t2");
        assert_eq!(merged.extra["name"], "Widget");
    }

    #[test]
    fn error_body_detects_not_authorized_code() {
        let body = ErrorBody::from_message(&json!({"error": {"code": 3010}})).unwrap();
        assert!(body.is_not_authorized());
        let body = ErrorBody::from_message(&json!({"error": {"code": "3010"}})).unwrap();
        assert!(body.is_not_authorized());
        assert!(ErrorBody::from_message(&json!({"error": "nope"})).is_none());
        assert!(ErrorBody::from_message(&json!({"ok": true})).is_none());
    }

    #[test]
    fn selector_requires_one_shared_key() {
        let selector = Selector::new().field("deviceId", "d1");
        assert!(!selector.matches(&object(json!({"name": "lamp"}))));
        assert!(selector.matches(&object(json!({"deviceId": "d1", "name": "lamp"}))));
    }

    #[test]
    fn selector_ignores_keys_missing_from_element() {
        let selector = Selector::new()
            .field("deviceId", "d1")
            .field("button", "on");
        assert!(selector.matches(&object(json!({"deviceId": "d1"}))));
        assert!(!selector.matches(&object(json!({"deviceId": "d1", "button": "off"}))));
    }

    #[test]
    fn trigger_set_parses_selector_fields_and_scene_refs() {
        let set: SceneTriggerSet = serde_json::from_value(json!({
            "devices": [{
                "deviceId": "d1",
                "actions": [{"button": "on", "scenes": ["s1", {"sceneId": "s2"}]}]
            }],
            "scenes": [{"sceneId": "s1", "roomId": "r1", "level": 100, "commands": [{"on": true}]}],
            "localDirectUrls": ["http://10.0.0.2:3205"]
        }))
        .unwrap();

        let device = set.device_for(&Selector::new().field("deviceId", "d1")).unwrap();
        let action = device
            .action_for(&Selector::new().field("button", "on"))
            .unwrap();
        let ids: Vec<&str> = action.scenes.iter().map(SceneRef::scene_id).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(set.scene("s1").unwrap().room_id, "r1");
        assert!(!set.scene("s1").unwrap().is_off());
    }
}
