use crate::events::{Events, HttpRequest, LinkRequest};
use crate::identity::IdentityStore;
use crate::platform::PlatformClient;
use crate::scenes::SceneCache;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::LOCATION, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, post},
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct LinkState {
    pub platform: PlatformClient,
    pub identity: Arc<IdentityStore>,
    pub scenes: Arc<SceneCache>,
    pub events: Arc<Events>,
    pub app_url: String,
}

/// Binds the first free port at or above `start_port`. Only ports already in
/// use are skipped; any other bind failure gives `None` straight away, as
/// does an exhausted port range.
pub async fn bind_with_fallback(host: &str, start_port: u16) -> Option<(TcpListener, u16)> {
    for port in start_port..=u16::MAX {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                tracing::info!(host, port, "link server bound");
                return Some((listener, port));
            }
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(host, port, "port in use, trying next")
            }
            Err(err) => {
                tracing::error!(host, port, error = %err, "cannot bind link server, not starting it");
                return None;
            }
        }
    }
    tracing::error!(host, start_port, "no free port for link server, not starting it");
    None
}

pub fn router(state: LinkState) -> Router {
    Router::new()
        .route("/link", any(link_handler))
        .route("/scene", post(scene_handler))
        .fallback(catch_all)
        .with_state(Arc::new(state))
}

pub async fn serve(listener: TcpListener, app: Router) {
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "link server stopped");
    }
}

/// Outbound interface address, found by "connecting" a UDP socket. No
/// packet is sent.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

pub fn direct_url(port: u16) -> Option<String> {
    local_ip().map(|ip| match ip {
        IpAddr::V4(v4) => format!("http://{v4}:{port}"),
        IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
    })
}

fn redirect(location: &str) -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(LOCATION, location.to_string())]).into_response()
}

async fn link_handler(
    State(state): State<Arc<LinkState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(link_token) = params.get("linkToken").filter(|t| !t.trim().is_empty()) else {
        return (StatusCode::OK, "No linkToken provided").into_response();
    };
    let Some(identity) = state.identity.current() else {
        return (StatusCode::OK, "Device is not registered").into_response();
    };
    let device_id = params
        .get("deviceId")
        .cloned()
        .unwrap_or_else(|| identity.device_id.clone());

    match state
        .platform
        .exchange_link_token(&identity, link_token, &device_id)
        .await
    {
        Ok(result) => {
            tracing::info!(%device_id, "device linked");
            let success_redirect = params.get("successRedirect").cloned();
            let request = LinkRequest {
                device_id,
                link_token: link_token.clone(),
                success_redirect: success_redirect.clone(),
                result,
            };
            match state.events.emit_link(request) {
                Some(response) => response,
                None => redirect(success_redirect.as_deref().unwrap_or(&state.app_url)),
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "link token exchange failed");
            (StatusCode::OK, err.to_string()).into_response()
        }
    }
}

async fn scene_handler(State(state): State<Arc<LinkState>>, body: Bytes) -> StatusCode {
    let scene_id = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("sceneId").and_then(Value::as_str).map(str::to_string));
    match scene_id {
        Some(scene_id) => {
            if state.scenes.apply_peer_selection(&scene_id).is_none() {
                tracing::debug!(%scene_id, "peer selected a scene we do not know");
            }
        }
        None => tracing::debug!("peer scene announcement without sceneId"),
    }
    StatusCode::OK
}

async fn catch_all(
    State(state): State<Arc<LinkState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = HttpRequest {
        method,
        path: uri.path().to_string(),
        query,
        headers,
        body,
    };
    state
        .events
        .emit_http(request)
        .unwrap_or_else(|| StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: LinkState,
        messages: Arc<Mutex<Vec<Value>>>,
    }

    fn fixture(api_url: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("device.json"),
            r#"{"deviceId":"d1","deviceToken":"t1"}"#,
        )
        .unwrap();
        let events = Events::new();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        events.on_message(move |m| sink.lock().unwrap().push(m));
        let platform = PlatformClient::new(api_url).unwrap();
        let scenes = Arc::new(SceneCache::new(
            dir.path().join("scenes.json"),
            events.clone(),
            platform.http().clone(),
            Duration::from_secs(20),
            16,
        ));
        let state = LinkState {
            platform,
            identity: Arc::new(IdentityStore::open(
                dir.path().join("device.json"),
                dir.path().join("scenes.json"),
            )),
            scenes,
            events,
            app_url: "https://app.example.test".to_string(),
        };
        Fixture {
            _dir: dir,
            state,
            messages,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn link_without_token_is_rejected_politely() {
        let f = fixture("http://127.0.0.1:1/v1/");
        let response = router(f.state)
            .oneshot(Request::get("/link").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "No linkToken provided");
    }

    #[tokio::test]
    async fn successful_link_redirects_to_success_url() {
        let mock = MockPlatform::default();
        mock.respond("link", json!({"linked": true}));
        let f = fixture(&mock.clone().serve().await);

        let response = router(f.state)
            .oneshot(
                Request::get("/link?linkToken=abc&successRedirect=http://x.test/done")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "http://x.test/done");
        assert_eq!(
            mock.calls(),
            vec![("link".to_string(), json!({"linkToken": "abc", "deviceId": "d1"}))]
        );
    }

    #[tokio::test]
    async fn successful_link_defaults_to_app_url() {
        let mock = MockPlatform::default();
        mock.respond("link", json!({"linked": true}));
        let f = fixture(&mock.serve().await);

        let response = router(f.state)
            .oneshot(
                Request::post("/link?linkToken=abc&deviceId=d7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://app.example.test");
    }

    #[tokio::test]
    async fn link_handler_overrides_redirect() {
        let mock = MockPlatform::default();
        mock.respond("link", json!({"linked": true}));
        let f = fixture(&mock.serve().await);
        f.state.events.on_link_request(|req| {
            (StatusCode::ACCEPTED, format!("linked {}", req.device_id)).into_response()
        });

        let response = router(f.state)
            .oneshot(Request::get("/link?linkToken=abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_text(response).await, "linked d1");
    }

    #[tokio::test]
    async fn failed_link_reports_error_text() {
        let mock = MockPlatform::default();
        mock.respond("link", json!({"error": {"code": 4001, "message": "bad token"}}));
        let f = fixture(&mock.serve().await);

        let response = router(f.state)
            .oneshot(Request::get("/link?linkToken=abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("bad token"));
    }

    #[tokio::test]
    async fn peer_scene_announcement_runs_commands() {
        let f = fixture("http://127.0.0.1:1/v1/");
        f.state.scenes.refresh(
            serde_json::from_value(json!({
                "scenes": [{"sceneId": "s1", "roomId": "r1", "level": 80,
                            "commands": [{"power": "on"}]}]
            }))
            .unwrap(),
        );
        let scenes = f.state.scenes.clone();

        let response = router(f.state)
            .oneshot(
                Request::post("/scene")
                    .body(Body::from(r#"{"sceneId":"s1","roomId":"r1","level":80}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*f.messages.lock().unwrap(), vec![json!({"power": "on"})]);
        assert_eq!(scenes.history().len(), 1);
    }

    #[tokio::test]
    async fn unknown_routes_go_to_generic_handler() {
        let f = fixture("http://127.0.0.1:1/v1/");
        let app = router(f.state.clone());
        let response = app
            .clone()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "");

        f.state.events.on_http_request(|req| {
            (StatusCode::IM_A_TEAPOT, format!("{} {:?}", req.path, req.query.get("q"))).into_response()
        });
        let response = app
            .oneshot(Request::put("/status?q=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(body_text(response).await, r#"/status Some("1")"#);
    }

    #[tokio::test]
    async fn bind_skips_occupied_ports() {
        // find P with P and P+1 both bindable, then hold both
        let (first, second, p) = loop {
            let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            let p = first.local_addr().unwrap().port();
            if p >= u16::MAX - 2 {
                continue;
            }
            if let Ok(second) = TcpListener::bind(("127.0.0.1", p + 1)).await {
                break (first, second, p);
            }
        };

        let (_third, bound) = bind_with_fallback("127.0.0.1", p).await.unwrap();
        assert_eq!(bound, p + 2);
        drop((first, second));
    }

    #[tokio::test]
    async fn bind_gives_up_on_non_local_address() {
        let started = std::time::Instant::now();
        assert!(bind_with_fallback("203.0.113.1", 50_000).await.is_none());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn direct_url_uses_bound_port() {
        if let Some(url) = direct_url(3205) {
            assert!(url.starts_with("http://"));
            assert!(url.ends_with(":3205"));
        }
    }
}
