//! Live connection to the platform.
//!
//! The channel is a small state machine driven by [`RealtimeChannel::run`]:
//! `Idle -> Connecting -> Connected -> Backoff(delay) -> Connecting ...`.
//! Each transport runs one connection attempt to completion and reports how
//! it ended; the loop decides whether to back off, reconnect or stop.

mod pull;
mod push;

pub use pull::keep_alive_loop;

use crate::config::{ChannelConfig, Transport};
use crate::events::Events;
use crate::identity::{IdentityStore, Termination};
use crate::model::{ErrorBody, Selector};
use crate::platform::{PlatformClient, PlatformError};
use crate::scenes::SceneCache;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Backoff(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no device identity available")]
    NoIdentity,
    #[error("no event stream url available")]
    NoStreamUrl,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("event stream error: {0}")]
    Stream(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("channel task has stopped")]
    Stopped,
}

/// Exponential reconnect delay: `min(max, min * 2^(n-1))` for the n-th
/// consecutive failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Everything a connection attempt needs, shared with the keep-alive task.
pub struct ChannelContext {
    pub config: ChannelConfig,
    pub socket_url: String,
    pub platform: PlatformClient,
    pub identity: Arc<IdentityStore>,
    pub scenes: Arc<SceneCache>,
    pub events: Arc<Events>,
    /// Properties announced in the snapshot sent on every open.
    pub desired: Map<String, Value>,
}

/// How a single connection attempt ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Connection was open and then closed (remote close, heartbeat expiry,
    /// credential swap).
    Closed,
    Failed(ChannelError),
    Terminate(Termination),
}

/// What the dispatcher wants the transport to do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Reconnect,
    Terminate(Termination),
}

#[derive(Debug, PartialEq)]
enum Inbound {
    AuthRevoked,
    RemoteDelete,
    SceneData(Option<Value>),
    Token { replacement: bool },
    Other,
}

/// Connection bookkeeping shared by both transports.
pub(crate) struct Supervisor {
    backoff: Backoff,
    state: watch::Sender<ChannelState>,
    events: Arc<Events>,
}

impl Supervisor {
    pub(crate) fn opened(&mut self) {
        self.backoff.reset();
        self.state.send_replace(ChannelState::Connected);
        self.events.emit_connect();
    }

    fn set(&self, state: ChannelState) {
        self.state.send_replace(state);
    }
}

pub struct RealtimeChannel {
    ctx: Arc<ChannelContext>,
    supervisor: Supervisor,
    outbound_rx: mpsc::UnboundedReceiver<Value>,
}

impl RealtimeChannel {
    pub fn new(ctx: Arc<ChannelContext>) -> (Self, ChannelHandle) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            backoff: Backoff::new(ctx.config.min_backoff(), ctx.config.max_backoff()),
            state: state_tx,
            events: ctx.events.clone(),
        };
        let handle = ChannelHandle {
            ctx: ctx.clone(),
            outbound: outbound_tx,
            state: state_rx,
        };
        (
            Self {
                ctx,
                supervisor,
                outbound_rx,
            },
            handle,
        )
    }

    /// Connects and keeps reconnecting until the device identity is gone.
    pub async fn run(mut self) -> Termination {
        loop {
            self.supervisor.set(ChannelState::Connecting);
            // anything queued while disconnected is stale
            while self.outbound_rx.try_recv().is_ok() {}

            let end = match self.ctx.config.transport {
                Transport::Push => {
                    push::run_once(&self.ctx, &mut self.outbound_rx, &mut self.supervisor).await
                }
                Transport::Pull => pull::run_once(&self.ctx, &mut self.supervisor).await,
            };

            match end {
                SessionEnd::Terminate(termination) => {
                    self.supervisor.set(ChannelState::Idle);
                    return termination;
                }
                SessionEnd::Closed => self.ctx.events.emit_close(),
                SessionEnd::Failed(err) => {
                    tracing::warn!(error = %err, "platform connection failed");
                    self.ctx.events.emit_error(err.to_string());
                }
            }

            let delay = self.supervisor.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting to platform");
            self.supervisor.set(ChannelState::Backoff(delay));
            tokio::time::sleep(delay).await;
        }
    }
}

/// Cheap, cloneable access to a running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    ctx: Arc<ChannelContext>,
    outbound: mpsc::UnboundedSender<Value>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelHandle {
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn transport(&self) -> Transport {
        self.ctx.config.transport
    }

    /// Sends a state update. On the push transport this is fire-and-forget
    /// and silently skipped while disconnected; on the pull transport it is
    /// a REST call and the platform's answer is returned.
    pub async fn patch(
        &self,
        selector: Option<&Selector>,
        properties: Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>, ChannelError> {
        let identity = self.ctx.identity.current().ok_or(ChannelError::NoIdentity)?;
        match self.ctx.config.transport {
            Transport::Push => {
                if !self.is_open() {
                    tracing::debug!("patch skipped, platform connection not open");
                    return Ok(None);
                }
                let frame = patch_frame(&identity.device_id, selector, properties);
                self.outbound
                    .send(Value::Object(frame))
                    .map_err(|_| ChannelError::Stopped)?;
                Ok(None)
            }
            Transport::Pull => {
                let response = self
                    .ctx
                    .platform
                    .patch(&identity, selector, &properties)
                    .await?;
                Ok(Some(response))
            }
        }
    }
}

fn patch_frame(
    device_id: &str,
    selector: Option<&Selector>,
    mut properties: Map<String, Value>,
) -> Map<String, Value> {
    match selector {
        Some(selector) if !selector.is_empty() => {
            properties.insert("query".to_string(), Value::Object(selector.to_map()));
        }
        _ => {
            properties.insert("deviceId".to_string(), Value::String(device_id.to_string()));
        }
    }
    properties
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn classify(message: &Value, identity: &IdentityStore) -> Inbound {
    if ErrorBody::from_message(message).is_some_and(|e| e.is_not_authorized()) {
        return Inbound::AuthRevoked;
    }
    if is_truthy(message.get("delete")) {
        if let Some(device) = message.get("device") {
            if identity.is_claimed_by(device) {
                return Inbound::RemoteDelete;
            }
        }
    }
    if let Some(data) = message.get("sceneTriggerData").filter(|d| d.is_object()) {
        return Inbound::SceneData(Some(data.clone()));
    }
    if is_truthy(message.get("sceneTriggerDataAvailable")) {
        return Inbound::SceneData(None);
    }
    if message.get("deviceToken").and_then(Value::as_str).is_some() {
        return Inbound::Token {
            replacement: is_truthy(message.get("replaceToken")),
        };
    }
    Inbound::Other
}

/// Routes one inbound message. Shared by both transports.
pub(crate) async fn dispatch(ctx: &ChannelContext, message: Value) -> Flow {
    match classify(&message, &ctx.identity) {
        Inbound::AuthRevoked => Flow::Terminate(ctx.identity.on_auth_revoked()),
        Inbound::RemoteDelete => {
            let claimed = message.get("device").cloned().unwrap_or(Value::Null);
            match ctx.identity.on_remote_delete(&claimed) {
                Some(termination) => {
                    ctx.scenes.purge_all();
                    Flow::Terminate(termination)
                }
                None => {
                    ctx.events.emit_message(message);
                    Flow::Continue
                }
            }
        }
        Inbound::SceneData(Some(inline)) => {
            match serde_json::from_value(inline) {
                Ok(triggers) => ctx.scenes.refresh(triggers),
                Err(err) => tracing::warn!(error = %err, "ignoring malformed scene trigger data"),
            }
            Flow::Continue
        }
        Inbound::SceneData(None) => {
            refresh_scene_data(ctx).await;
            Flow::Continue
        }
        Inbound::Token { replacement } => {
            let Value::Object(mut update) = message else {
                return Flow::Continue;
            };
            update.remove("replaceToken");
            match ctx.identity.apply_update(&update) {
                Ok(identity) => {
                    tracing::info!(device_id = %identity.device_id, replacement, "device token updated");
                    if replacement {
                        Flow::Reconnect
                    } else {
                        Flow::Continue
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rejected device token update");
                    ctx.events.emit_error(err.to_string());
                    Flow::Continue
                }
            }
        }
        Inbound::Other => {
            if ctx.scenes.is_echo(&message) {
                tracing::debug!(%message, "suppressed echo of locally dispatched scene");
            } else {
                ctx.events.emit_message(message);
            }
            Flow::Continue
        }
    }
}

async fn refresh_scene_data(ctx: &ChannelContext) {
    let Some(identity) = ctx.identity.current() else {
        return;
    };
    match ctx.platform.fetch_scene_trigger_data(&identity).await {
        Ok(triggers) => ctx.scenes.refresh(triggers),
        Err(err) => {
            tracing::warn!(error = %err, "failed to fetch scene trigger data");
            ctx.events.emit_error(err.to_string());
        }
    }
}
