use crate::model::{DeviceIdentity, ErrorBody, SceneTriggerSet, Selector};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde_json::{Map, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// REST client for the device-facing platform API.
#[derive(Clone, Debug)]
pub struct PlatformClient {
    http: Client,
    stream_http: Client,
    base_url: Url,
    client_version: String,
}

#[derive(Clone, Debug)]
pub struct PlatformClientBuilder {
    base_url: String,
    client_version: String,
    timeout: Duration,
}

impl PlatformClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<PlatformClient, PlatformError> {
        PlatformClient::from_parts(self.base_url, self.client_version, self.timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("config error: {0}")]
    Config(&'static str),
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("platform error {}: {message}", code_label(.code))]
    Api { code: Option<i64>, message: String },
    #[error("unexpected response {status}: {body}")]
    Status { status: StatusCode, body: String },
}

fn code_label(code: &Option<i64>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
}

impl PlatformError {
    pub fn is_not_authorized(&self) -> bool {
        matches!(
            self,
            PlatformError::Api {
                code: Some(crate::model::NOT_AUTHORIZED_CODE),
                ..
            }
        )
    }
}

impl PlatformClient {
    pub fn builder(base_url: impl Into<String>) -> PlatformClientBuilder {
        PlatformClientBuilder::new(base_url)
    }

    pub fn new(base_url: impl Into<String>) -> Result<Self, PlatformError> {
        Self::builder(base_url).build()
    }

    fn from_parts(
        base_url: String,
        client_version: String,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        if client_version.trim().is_empty() {
            return Err(PlatformError::Config(
                "client version header value must not be empty",
            ));
        }

        let mut parsed =
            Url::parse(base_url.trim()).map_err(|err| PlatformError::Url(err.to_string()))?;
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder().timeout(timeout).build()?;
        // event streams stay open indefinitely; only bound the handshake
        let stream_http = Client::builder().connect_timeout(timeout).build()?;

        Ok(Self {
            http,
            stream_http,
            base_url: parsed,
            client_version,
        })
    }

    /// The underlying HTTP client, shared with the event stream and peer broadcasts.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub async fn create_device(
        &self,
        desired: &Map<String, Value>,
    ) -> Result<DeviceIdentity, PlatformError> {
        let req = self.build_create_device_request(desired)?;
        let body = self.execute(req).await?;
        parse_identity_response(&body)
    }

    /// Returns the raw response object; the caller merges it over the held identity.
    pub async fn update_device(
        &self,
        identity: &DeviceIdentity,
        desired: &Map<String, Value>,
    ) -> Result<Map<String, Value>, PlatformError> {
        let req = self.build_update_device_request(identity, desired)?;
        let body = self.execute(req).await?;
        parse_object_response(&body)
    }

    pub async fn keep_alive(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Map<String, Value>, PlatformError> {
        let req = self.build_keep_alive_request(identity)?;
        let body = self.execute(req).await?;
        parse_object_response(&body)
    }

    pub async fn exchange_link_token(
        &self,
        identity: &DeviceIdentity,
        link_token: &str,
        device_id: &str,
    ) -> Result<Map<String, Value>, PlatformError> {
        let req = self.build_link_request(identity, link_token, device_id)?;
        let body = self.execute(req).await?;
        parse_object_response(&body)
    }

    pub async fn patch(
        &self,
        identity: &DeviceIdentity,
        selector: Option<&Selector>,
        properties: &Map<String, Value>,
    ) -> Result<Map<String, Value>, PlatformError> {
        let req = self.build_patch_request(identity, selector, properties)?;
        let body = self.execute(req).await?;
        parse_object_response(&body)
    }

    pub async fn fetch_scene_trigger_data(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<SceneTriggerSet, PlatformError> {
        let req = self.build_scene_data_request(identity)?;
        let body = self.execute(req).await?;
        parse_scene_data_response(&body)
    }

    async fn execute(&self, req: Request) -> Result<String, PlatformError> {
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() && serde_json::from_str::<Value>(&body).is_err() {
            return Err(PlatformError::Status { status, body });
        }
        Ok(body)
    }

    pub fn build_create_device_request(
        &self,
        desired: &Map<String, Value>,
    ) -> Result<Request, PlatformError> {
        self.build_json_request(Method::POST, "devices", None, &Value::Object(desired.clone()))
    }

    pub fn build_update_device_request(
        &self,
        identity: &DeviceIdentity,
        desired: &Map<String, Value>,
    ) -> Result<Request, PlatformError> {
        let path = format!("devices/{}", identity.device_id);
        self.build_json_request(
            Method::PATCH,
            &path,
            Some(identity),
            &Value::Object(desired.clone()),
        )
    }

    pub fn build_keep_alive_request(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Request, PlatformError> {
        let path = format!("devices/{}/keepalive", identity.device_id);
        self.build_json_request(Method::POST, &path, Some(identity), &Value::Object(Map::new()))
    }

    pub fn build_link_request(
        &self,
        identity: &DeviceIdentity,
        link_token: &str,
        device_id: &str,
    ) -> Result<Request, PlatformError> {
        if link_token.trim().is_empty() {
            return Err(PlatformError::Config("linkToken must not be empty"));
        }
        let body = serde_json::json!({
            "linkToken": link_token.trim(),
            "deviceId": device_id,
        });
        self.build_json_request(Method::POST, "links", Some(identity), &body)
    }

    pub fn build_patch_request(
        &self,
        identity: &DeviceIdentity,
        selector: Option<&Selector>,
        properties: &Map<String, Value>,
    ) -> Result<Request, PlatformError> {
        let mut body = properties.clone();
        let path = match selector {
            Some(selector) if !selector.is_empty() => {
                body.insert("query".to_string(), Value::Object(selector.to_map()));
                "devices".to_string()
            }
            _ => format!("devices/{}", identity.device_id),
        };
        self.build_json_request(Method::PATCH, &path, Some(identity), &Value::Object(body))
    }

    pub fn build_scene_data_request(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Request, PlatformError> {
        let path = format!("devices/{}/sceneTriggerData", identity.device_id);
        self.build_request_builder(Method::GET, &path, Some(identity))?
            .build()
            .map_err(PlatformError::Http)
    }

    /// Request for the server-sent event stream used by the pull transport.
    pub fn event_stream_request(
        &self,
        identity: &DeviceIdentity,
        stream_url: &str,
    ) -> Result<reqwest::RequestBuilder, PlatformError> {
        let url = Url::parse(stream_url).map_err(|err| PlatformError::Url(err.to_string()))?;
        let headers = self.common_headers(Some(identity))?;
        Ok(self.stream_http.get(url).headers(headers))
    }

    fn build_json_request(
        &self,
        method: Method,
        path: &str,
        identity: Option<&DeviceIdentity>,
        body: &Value,
    ) -> Result<Request, PlatformError> {
        let body = serde_json::to_vec(body)?;
        self.build_request_builder(method, path, identity)?
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(PlatformError::Http)
    }

    fn build_request_builder(
        &self,
        method: Method,
        path: &str,
        identity: Option<&DeviceIdentity>,
    ) -> Result<reqwest::RequestBuilder, PlatformError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| PlatformError::Url(err.to_string()))?;
        let headers = self.common_headers(identity)?;
        Ok(self.http.request(method, url).headers(headers))
    }

    fn common_headers(&self, identity: Option<&DeviceIdentity>) -> Result<HeaderMap, PlatformError> {
        let mut headers = HeaderMap::new();
        if let Some(identity) = identity {
            if !identity.device_token.trim().is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", identity.device_token.trim()))?,
                );
            }
        }
        headers.insert(
            "X-Thinkdevice-Client-Version",
            HeaderValue::from_str(self.client_version.trim())?,
        );
        Ok(headers)
    }
}

/// Parses a response that must be a JSON object, surfacing `{error:{...}}` as `Api`.
pub fn parse_object_response(body: &str) -> Result<Map<String, Value>, PlatformError> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(error) = ErrorBody::from_message(&value) {
        return Err(PlatformError::Api {
            code: error.code,
            message: error.message.unwrap_or_default(),
        });
    }
    match value {
        Value::Object(map) => Ok(map),
        other => Err(PlatformError::Api {
            code: None,
            message: format!("expected object, got {other}"),
        }),
    }
}

pub fn parse_identity_response(body: &str) -> Result<DeviceIdentity, PlatformError> {
    let map = parse_object_response(body)?;
    DeviceIdentity::from_value(Value::Object(map)).ok_or(PlatformError::Api {
        code: None,
        message: "response did not carry a deviceId".to_string(),
    })
}

/// Accepts either `{ "sceneTriggerData": {...} }` or the bare set.
pub fn parse_scene_data_response(body: &str) -> Result<SceneTriggerSet, PlatformError> {
    let mut map = parse_object_response(body)?;
    let data = map
        .remove("sceneTriggerData")
        .unwrap_or(Value::Object(map));
    Ok(serde_json::from_value(data)?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> PlatformClient {
        PlatformClient::builder("https://api.example.test/v1")
            .client_version("0.3.0")
            .build()
            .unwrap()
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_value(json!({"deviceId": "d1", "deviceToken": "t1"})).unwrap()
    }

    #[test]
    fn create_request_posts_desired_properties_without_auth() {
        let mut desired = Map::new();
        desired.insert("name".to_string(), json!("X"));
        let req = client().build_create_device_request(&desired).unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "https://api.example.test/v1/devices");
        assert!(req.headers().get(AUTHORIZATION).is_none());
        assert_eq!(
            req.headers().get("X-Thinkdevice-Client-Version").unwrap(),
            &HeaderValue::from_static("0.3.0")
        );
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "X"}));
    }

    #[test]
    fn update_request_targets_device_with_bearer_token() {
        let req = client()
            .build_update_device_request(&identity(), &Map::new())
            .unwrap();
        assert_eq!(req.method(), Method::PATCH);
        assert_eq!(req.url().as_str(), "https://api.example.test/v1/devices/d1");
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("Bearer t1")
        );
    }

    #[test]
    fn patch_request_by_selector_uses_query_body() {
        let mut props = Map::new();
        props.insert("button".to_string(), json!("on"));
        let selector = Selector::new().field("roomId", "r1");
        let req = client()
            .build_patch_request(&identity(), Some(&selector), &props)
            .unwrap();
        assert_eq!(req.url().as_str(), "https://api.example.test/v1/devices");
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"button": "on", "query": {"roomId": "r1"}}));
    }

    #[test]
    fn link_request_rejects_blank_token() {
        let err = client()
            .build_link_request(&identity(), "  ", "d1")
            .unwrap_err();
        assert!(format!("{err}").contains("linkToken"));
    }

    #[test]
    fn parse_object_surfaces_platform_errors() {
        let err = parse_object_response(r#"{"error":{"code":3010,"message":"not authorized"}}"#)
            .unwrap_err();
        assert!(err.is_not_authorized());
        assert!(format!("{err}").contains("3010"));
    }

    #[test]
    fn parse_identity_requires_device_id() {
        assert!(parse_identity_response(r#"{"deviceToken":"t1"}"#).is_err());
        let identity = parse_identity_response(r#"{"deviceId":"d1","deviceToken":"t1"}"#).unwrap();
        assert_eq!(identity.device_token, "t1");
    }

    #[test]
    fn parse_scene_data_accepts_wrapped_and_bare_sets() {
        let wrapped = parse_scene_data_response(
            r#"{"sceneTriggerData":{"scenes":[{"sceneId":"s1","roomId":"r1","level":0}]}}"#,
        )
        .unwrap();
        assert_eq!(wrapped.scenes.len(), 1);

        let bare = parse_scene_data_response(r#"{"localDirectUrls":["http://hub:3205"]}"#).unwrap();
        assert_eq!(bare.local_direct_urls, vec!["http://hub:3205".to_string()]);
    }
}
