//! Entry point for consumers: owns every component and starts the
//! lifecycle on [`Session::connect`].

use crate::channel::{
    self, Backoff, ChannelContext, ChannelError, ChannelHandle, ChannelState, RealtimeChannel,
};
use crate::config::{Config, Transport};
use crate::events::Events;
use crate::identity::{IdentityError, IdentityStore, Termination};
use crate::locks::{LockError, PeripheralLocks};
use crate::model::{DeviceIdentity, Selector};
use crate::platform::{PlatformClient, PlatformError};
use crate::scenes::SceneCache;
use crate::server::{self, LinkState};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("session is not connected")]
    NotConnected,
    #[error("session is already connected")]
    AlreadyConnected,
}

impl SessionError {
    /// Set when the failure also ended the device identity.
    pub fn termination(&self) -> Option<Termination> {
        match self {
            SessionError::Identity(IdentityError::Terminated(t)) => Some(*t),
            _ => None,
        }
    }
}

struct Running {
    channel: ChannelHandle,
    port: Option<u16>,
    direct_url: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct Session {
    config: Config,
    platform: PlatformClient,
    identity: Arc<IdentityStore>,
    scenes: Arc<SceneCache>,
    locks: PeripheralLocks,
    events: Arc<Events>,
    running: Mutex<Option<Running>>,
    connecting: AtomicBool,
    termination_tx: mpsc::UnboundedSender<Termination>,
    termination_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Termination>>,
}

impl Session {
    pub fn new(config: Config) -> Result<Self, SessionError> {
        let platform = PlatformClient::builder(config.platform.api_url.clone())
            .timeout(Duration::from_secs(config.platform.timeout_secs))
            .build()?;
        let events = Events::new();
        let identity = Arc::new(IdentityStore::open(
            &config.storage.identity_path,
            &config.storage.scene_path,
        ));
        let scenes = Arc::new(SceneCache::new(
            &config.storage.scene_path,
            events.clone(),
            platform.http().clone(),
            config.scenes.room_timeout(),
            config.scenes.history_limit,
        ));
        let locks = PeripheralLocks::new(config.locks.lock_dir());
        let (termination_tx, termination_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            platform,
            identity,
            scenes,
            locks,
            events,
            running: Mutex::new(None),
            connecting: AtomicBool::new(false),
            termination_tx,
            termination_rx: tokio::sync::Mutex::new(termination_rx),
        })
    }

    /// Handler registration. Register before `connect` to see the first open.
    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    /// Registers or updates the device, then starts the link server, the
    /// platform channel and the background timers.
    ///
    /// Platform failures during registration are reported to the error
    /// handler and retried with backoff. A revoked credential, a device-id
    /// mismatch or a local storage fault ends the call with an error.
    pub async fn connect(
        &self,
        properties: Map<String, Value>,
    ) -> Result<DeviceIdentity, SessionError> {
        let _guard =
            ConnectGuard::acquire(&self.connecting).ok_or(SessionError::AlreadyConnected)?;
        if self.lock_running().is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        self.scenes.load();

        let mut desired = self.config.device.desired_properties();
        desired.extend(properties);

        let bound = if self.config.link.enabled {
            server::bind_with_fallback(&self.config.link.bind_host, self.config.link.port).await
        } else {
            None
        };
        let port = bound.as_ref().map(|(_, port)| *port);
        let direct_url = port.and_then(server::direct_url);
        if let Some(url) = &direct_url {
            desired.insert("directUrl".to_string(), Value::String(url.clone()));
        }

        let identity = self.register_until_answered(&desired).await?;
        if direct_url.is_some() {
            self.identity.set_direct_url(direct_url.clone());
        }
        tracing::info!(device_id = %identity.device_id, port, "device registered");

        let mut tasks = Vec::new();
        if let Some((listener, _)) = bound {
            let app = server::router(LinkState {
                platform: self.platform.clone(),
                identity: self.identity.clone(),
                scenes: self.scenes.clone(),
                events: self.events.clone(),
                app_url: self.config.platform.app_url.clone(),
            });
            tasks.push(tokio::spawn(server::serve(listener, app)));
        }

        let ctx = Arc::new(ChannelContext {
            config: self.config.channel.clone(),
            socket_url: self.config.platform.socket_url.clone(),
            platform: self.platform.clone(),
            identity: self.identity.clone(),
            scenes: self.scenes.clone(),
            events: self.events.clone(),
            desired,
        });
        let (realtime, handle) = RealtimeChannel::new(ctx.clone());
        let tx = self.termination_tx.clone();
        tasks.push(tokio::spawn(async move {
            let _ = tx.send(realtime.run().await);
        }));

        if self.config.channel.transport == Transport::Pull {
            let tx = self.termination_tx.clone();
            tasks.push(tokio::spawn(async move {
                let _ = tx.send(channel::keep_alive_loop(ctx).await);
            }));
        }

        let scenes = self.scenes.clone();
        let sweep_every = self.config.scenes.sweep_interval().max(Duration::from_millis(10));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                scenes.sweep(Instant::now());
            }
        }));

        *self.lock_running() = Some(Running {
            channel: handle,
            port,
            direct_url,
            tasks,
        });
        Ok(identity)
    }

    async fn register_until_answered(
        &self,
        desired: &Map<String, Value>,
    ) -> Result<DeviceIdentity, IdentityError> {
        let mut backoff = Backoff::new(
            self.config.channel.min_backoff(),
            self.config.channel.max_backoff(),
        );
        loop {
            match self.identity.register_or_update(&self.platform, desired).await {
                Err(IdentityError::Platform(err)) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %err, ?delay, "device registration failed, retrying");
                    self.events.emit_error(err.to_string());
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Sends a state update. When the update matches a scene trigger the
    /// scene is dispatched locally first and its id travels with the patch.
    pub async fn patch(
        &self,
        selector: Option<&Selector>,
        mut properties: Map<String, Value>,
    ) -> Result<Option<Map<String, Value>>, SessionError> {
        let channel = self
            .lock_running()
            .as_ref()
            .map(|r| r.channel.clone())
            .ok_or(SessionError::NotConnected)?;

        if self.config.scenes.dedupe_patches {
            let device_selector = match selector {
                Some(selector) => selector.clone(),
                None => {
                    let device_id = self.identity.device_id().unwrap_or_default();
                    Selector::new().field("deviceId", device_id)
                }
            };
            if let Some(scene_id) = self.scenes.select_scene_for(&device_selector, &properties) {
                properties.insert("sceneId".to_string(), Value::String(scene_id));
                if self.config.scenes.silent_patches {
                    properties.insert("silent".to_string(), Value::Bool(true));
                }
            }
        }

        match channel.patch(selector, properties).await {
            Ok(response) => Ok(response),
            Err(ChannelError::Platform(err)) if err.is_not_authorized() => {
                let _ = self.termination_tx.send(self.identity.on_auth_revoked());
                Err(ChannelError::Platform(err).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn lock_peripheral(&self, resource_path: &str) -> Result<(), SessionError> {
        self.lock_peripheral_within(resource_path, self.config.locks.wait())
            .await
    }

    pub async fn lock_peripheral_within(
        &self,
        resource_path: &str,
        wait: Duration,
    ) -> Result<(), SessionError> {
        Ok(self.locks.acquire(resource_path, wait).await?)
    }

    pub fn unlock_peripheral(&self, resource_path: &str) -> Result<(), SessionError> {
        Ok(self.locks.release(resource_path)?)
    }

    pub fn direct_url(&self) -> Option<String> {
        self.lock_running().as_ref().and_then(|r| r.direct_url.clone())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.lock_running().as_ref().and_then(|r| r.port)
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.current()
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.lock_running().as_ref().map(|r| r.channel.state())
    }

    /// Resolves once the device identity is gone. Background tasks are
    /// stopped before returning.
    pub async fn wait_for_termination(&self) -> Termination {
        let received = self.termination_rx.lock().await.recv().await;
        self.lock_running().take();
        match received {
            Some(termination) => termination,
            // the session keeps a sender, so the queue never closes
            None => std::future::pending().await,
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the whole of a `connect` call, including across cancellation.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
