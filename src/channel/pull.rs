use super::{dispatch, ChannelContext, ChannelError, Flow, SessionEnd, Supervisor};
use crate::identity::Termination;
use crate::model::parse_message;
use futures_util::StreamExt;
use reqwest_eventsource::{retry, Error as StreamError, Event, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant};

pub(super) async fn run_once(ctx: &ChannelContext, supervisor: &mut Supervisor) -> SessionEnd {
    let Some(identity) = ctx.identity.current() else {
        return SessionEnd::Failed(ChannelError::NoIdentity);
    };
    let Some(stream_url) = identity
        .stream_url()
        .map(str::to_string)
        .or_else(|| ctx.config.stream_url.clone())
    else {
        return SessionEnd::Failed(ChannelError::NoStreamUrl);
    };

    let request = match ctx.platform.event_stream_request(&identity, &stream_url) {
        Ok(request) => request,
        Err(err) => return SessionEnd::Failed(err.into()),
    };
    let mut source = match EventSource::new(request) {
        Ok(source) => source,
        Err(err) => return SessionEnd::Failed(ChannelError::Stream(err.to_string())),
    };
    // reconnects go through our own backoff
    source.set_retry_policy(Box::new(retry::Never));

    let idle = ctx.config.stream_idle_timeout();
    let liveness = sleep(idle);
    tokio::pin!(liveness);
    let mut opened = false;

    loop {
        tokio::select! {
            _ = &mut liveness => {
                tracing::warn!(idle_secs = idle.as_secs(), "event stream idle, reopening");
                source.close();
                return SessionEnd::Closed;
            }
            event = source.next() => match event {
                Some(Ok(Event::Open)) => {
                    opened = true;
                    supervisor.opened();
                }
                Some(Ok(Event::Message(message))) => {
                    liveness.as_mut().reset(Instant::now() + idle);
                    match dispatch(ctx, parse_message(&message.data)).await {
                        Flow::Continue => {}
                        Flow::Reconnect => {
                            source.close();
                            return SessionEnd::Closed;
                        }
                        Flow::Terminate(termination) => {
                            source.close();
                            return SessionEnd::Terminate(termination);
                        }
                    }
                }
                Some(Err(StreamError::StreamEnded)) | None if opened => {
                    source.close();
                    return SessionEnd::Closed;
                }
                Some(Err(err)) => {
                    source.close();
                    return SessionEnd::Failed(ChannelError::Stream(err.to_string()));
                }
                None => return SessionEnd::Failed(ChannelError::Stream("stream ended before open".to_string())),
            }
        }
    }
}

/// Periodic keep-alive for the pull transport. The platform answers with
/// the device record, which is merged into the held identity. Returns only
/// when the platform revokes the credential.
pub async fn keep_alive_loop(ctx: Arc<ChannelContext>) -> Termination {
    let period = ctx.config.keepalive_interval().max(Duration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(identity) = ctx.identity.current() else {
            continue;
        };
        match ctx.platform.keep_alive(&identity).await {
            Ok(update) => {
                if let Err(err) = ctx.identity.apply_update(&update) {
                    tracing::warn!(error = %err, "keep-alive response not applied");
                }
            }
            Err(err) if err.is_not_authorized() => return ctx.identity.on_auth_revoked(),
            Err(err) => {
                tracing::warn!(error = %err, "keep-alive failed");
                ctx.events.emit_error(err.to_string());
            }
        }
    }
}
