use axum::{
    body::Bytes,
    http::{HeaderMap, Method},
    response::Response,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Request handed to the catch-all HTTP handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Successful link-token exchange, handed to the link handler.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub device_id: String,
    pub link_token: String,
    pub success_redirect: Option<String>,
    pub result: Map<String, Value>,
}

type ConnectFn = dyn Fn() + Send + Sync;
type MessageFn = dyn Fn(Value) + Send + Sync;
type ErrorFn = dyn Fn(String) + Send + Sync;
type LinkFn = dyn Fn(LinkRequest) -> Response + Send + Sync;
type HttpFn = dyn Fn(HttpRequest) -> Response + Send + Sync;

struct Slot<F: ?Sized>(Mutex<Option<Arc<F>>>);

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self(Mutex::new(None))
    }
}

impl<F: ?Sized> Slot<F> {
    fn set(&self, handler: Arc<F>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn get(&self) -> Option<Arc<F>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Consumer callbacks, one slot per event kind. Registering again replaces
/// the previous handler.
#[derive(Default)]
pub struct Events {
    connect: Slot<ConnectFn>,
    close: Slot<ConnectFn>,
    message: Slot<MessageFn>,
    error: Slot<ErrorFn>,
    link: Slot<LinkFn>,
    http: Slot<HttpFn>,
}

impl Events {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.connect.set(Arc::new(f));
    }

    pub fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
        self.close.set(Arc::new(f));
    }

    pub fn on_message(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        self.message.set(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.error.set(Arc::new(f));
    }

    pub fn on_link_request(&self, f: impl Fn(LinkRequest) -> Response + Send + Sync + 'static) {
        self.link.set(Arc::new(f));
    }

    pub fn on_http_request(&self, f: impl Fn(HttpRequest) -> Response + Send + Sync + 'static) {
        self.http.set(Arc::new(f));
    }

    pub(crate) fn emit_connect(&self) {
        match self.connect.get() {
            Some(f) => f(),
            None => tracing::info!("connection to platform opened"),
        }
    }

    pub(crate) fn emit_close(&self) {
        match self.close.get() {
            Some(f) => f(),
            None => tracing::info!("connection to platform closed"),
        }
    }

    pub(crate) fn emit_message(&self, message: Value) {
        match self.message.get() {
            Some(f) => f(message),
            None => tracing::info!(%message, "received from platform"),
        }
    }

    pub(crate) fn emit_error(&self, error: String) {
        match self.error.get() {
            Some(f) => f(error),
            None => tracing::warn!(%error, "platform channel error"),
        }
    }

    /// `None` when no link handler is registered.
    pub(crate) fn emit_link(&self, request: LinkRequest) -> Option<Response> {
        self.link.get().map(|f| f(request))
    }

    /// `None` when no catch-all handler is registered.
    pub(crate) fn emit_http(&self, request: HttpRequest) -> Option<Response> {
        self.http.get().map(|f| f(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn last_registration_wins() {
        let events = Events::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        events.on_message(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        events.on_message(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        events.emit_message(serde_json::json!({"button": "on"}));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_http_handlers_report_none() {
        let events = Events::new();
        let request = HttpRequest {
            method: Method::GET,
            path: "/status".to_string(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(events.emit_http(request).is_none());
    }
}
