use super::{dispatch, ChannelContext, ChannelError, Flow, SessionEnd, Supervisor};
use crate::model::{parse_message, DeviceIdentity};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// `wss://host/path?token=<deviceToken>`
pub(crate) fn socket_url(base: &str, token: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base).map_err(|err| ChannelError::Stream(err.to_string()))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// Identity plus desired properties, sent once per open.
pub(crate) fn snapshot_frame(identity: &DeviceIdentity, desired: &Map<String, Value>) -> Value {
    let mut frame = desired.clone();
    frame.extend(identity.to_map());
    Value::Object(frame)
}

pub(super) async fn run_once(
    ctx: &ChannelContext,
    outbound: &mut mpsc::UnboundedReceiver<Value>,
    supervisor: &mut Supervisor,
) -> SessionEnd {
    let Some(identity) = ctx.identity.current() else {
        return SessionEnd::Failed(ChannelError::NoIdentity);
    };
    let url = match socket_url(&ctx.socket_url, &identity.device_token) {
        Ok(url) => url,
        Err(err) => return SessionEnd::Failed(err),
    };

    tracing::debug!(host = url.host_str().unwrap_or_default(), "opening platform socket");
    let (socket, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => return SessionEnd::Failed(err.into()),
    };
    let (mut sink, mut stream) = socket.split();
    supervisor.opened();

    let snapshot = snapshot_frame(&identity, &ctx.desired);
    if let Err(err) = sink.send(Message::Text(snapshot.to_string())).await {
        return SessionEnd::Failed(err.into());
    }

    let heartbeat = ctx.config.heartbeat_timeout();
    let liveness = sleep(heartbeat);
    tokio::pin!(liveness);

    loop {
        tokio::select! {
            _ = &mut liveness => {
                tracing::warn!(timeout_ms = heartbeat.as_millis() as u64, "no ping from platform, dropping connection");
                let _ = sink.close().await;
                return SessionEnd::Closed;
            }
            Some(frame) = outbound.recv() => {
                if let Err(err) = sink.send(Message::Text(frame.to_string())).await {
                    return SessionEnd::Failed(err.into());
                }
            }
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(_))) => {
                        liveness.as_mut().reset(Instant::now() + heartbeat);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return SessionEnd::Failed(err.into()),
                };
                match dispatch(ctx, parse_message(&text)).await {
                    Flow::Continue => {}
                    Flow::Reconnect => {
                        tracing::info!("credential replaced, reopening platform socket");
                        let _ = sink.close().await;
                        return SessionEnd::Closed;
                    }
                    Flow::Terminate(termination) => {
                        let _ = sink.close().await;
                        return SessionEnd::Terminate(termination);
                    }
                }
            }
        }
    }
}
