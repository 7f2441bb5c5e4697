//! Scene/trigger cache with per-room deduplication.
//!
//! A device action maps to an ordered list of candidate scenes. Each room
//! remembers which scenes were already dispatched since it last settled, so
//! repeating the same action walks through the candidates instead of firing
//! the same scene again. A room settles when its timer runs out; selecting a
//! level-0 scene clears it immediately.

use crate::events::Events;
use crate::model::{Scene, SceneTriggerSet, Selector};
use crate::persist;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub scene_id: String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSceneState {
    pub room_id: String,
    pub current_scene_id: String,
    /// `None` once the timer has fired and the room has settled.
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SceneFile {
    #[serde(rename = "sceneTriggerData", default)]
    scene_trigger_data: SceneTriggerSet,
}

/// Announcement sent to other local hubs when this hub selects a scene.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerSelection {
    #[serde(rename = "sceneId")]
    pub scene_id: String,
    #[serde(rename = "roomId", default)]
    pub room_id: String,
    #[serde(default)]
    pub level: f64,
}

#[derive(Debug, Default)]
struct SceneState {
    triggers: SceneTriggerSet,
    rooms: HashMap<String, RoomSceneState>,
    history: VecDeque<HistoryEntry>,
}

impl SceneState {
    fn in_history(&self, scene: &Scene) -> bool {
        self.history
            .iter()
            .any(|e| e.scene_id == scene.scene_id && e.room_id == scene.room_id)
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<(String, String)> = self
            .rooms
            .values()
            .filter(|room| room.expires_at.is_some_and(|at| at <= now))
            .map(|room| (room.room_id.clone(), room.current_scene_id.clone()))
            .collect();

        for (room_id, current) in expired {
            self.history
                .retain(|e| e.room_id != room_id || e.scene_id == current);
            let still_referenced = self.history.iter().any(|e| e.room_id == room_id);
            if still_referenced {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.expires_at = None;
                }
            } else {
                self.rooms.remove(&room_id);
            }
            tracing::debug!(room_id = %room_id, "room scene timer expired");
        }
    }

    fn record(&mut self, scene: &Scene, now: Instant, timeout: Duration, limit: usize) {
        let room = self
            .rooms
            .entry(scene.room_id.clone())
            .or_insert_with(|| RoomSceneState {
                room_id: scene.room_id.clone(),
                current_scene_id: scene.scene_id.clone(),
                expires_at: None,
            });
        room.current_scene_id = scene.scene_id.clone();
        room.expires_at = Some(now + timeout);

        if scene.is_off() {
            self.history.retain(|e| e.room_id != scene.room_id);
            return;
        }
        if self.in_history(scene) {
            return;
        }
        self.history.push_back(HistoryEntry {
            scene_id: scene.scene_id.clone(),
            room_id: scene.room_id.clone(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

pub struct SceneCache {
    path: PathBuf,
    events: Arc<Events>,
    http: reqwest::Client,
    room_timeout: Duration,
    history_limit: usize,
    state: Mutex<SceneState>,
}

impl SceneCache {
    pub fn new(
        path: impl Into<PathBuf>,
        events: Arc<Events>,
        http: reqwest::Client,
        room_timeout: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            path: path.into(),
            events,
            http,
            room_timeout,
            history_limit: history_limit.max(1),
            state: Mutex::new(SceneState::default()),
        }
    }

    /// Restores the persisted trigger set. A missing or malformed file
    /// leaves the cache empty.
    pub fn load(&self) {
        let triggers = persist::read_json::<SceneFile>(&self.path)
            .map(|file| file.scene_trigger_data)
            .unwrap_or_default();
        tracing::debug!(
            scenes = triggers.scenes.len(),
            devices = triggers.devices.len(),
            "scene trigger data loaded"
        );
        self.lock().triggers = triggers;
    }

    /// Replaces the trigger set wholesale and persists it.
    pub fn refresh(&self, triggers: SceneTriggerSet) {
        let file = SceneFile {
            scene_trigger_data: triggers.clone(),
        };
        match serde_json::to_vec(&file) {
            Ok(data) => {
                if let Err(err) = persist::write_atomic(&self.path, &data) {
                    tracing::warn!(error = %err, "failed to persist scene trigger data");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode scene trigger data"),
        }
        tracing::info!(scenes = triggers.scenes.len(), "scene trigger data refreshed");
        self.lock().triggers = triggers;
    }

    pub fn triggers(&self) -> SceneTriggerSet {
        self.lock().triggers.clone()
    }

    pub fn select_scene_for(
        &self,
        device_selector: &Selector,
        action: &Map<String, Value>,
    ) -> Option<String> {
        self.select_scene_at(device_selector, action, Instant::now())
    }

    /// Picks the scene for a device action, dispatches its commands, tells
    /// the other local hubs and records it against the room.
    pub fn select_scene_at(
        &self,
        device_selector: &Selector,
        action: &Map<String, Value>,
        now: Instant,
    ) -> Option<String> {
        let (scene, peers) = {
            let mut state = self.lock();
            state.purge_expired(now);

            let scene = match action.get("sceneId").and_then(Value::as_str) {
                Some(scene_id) => state.triggers.scene(scene_id).cloned(),
                None => {
                    let action_selector = Selector::from_map(action);
                    let triggers = &state.triggers;
                    triggers
                        .device_for(device_selector)
                        .and_then(|device| device.action_for(&action_selector))
                        .and_then(|entry| {
                            entry
                                .scenes
                                .iter()
                                .filter_map(|r| triggers.scene(r.scene_id()))
                                .find(|scene| !state.in_history(scene))
                                .cloned()
                        })
                }
            }?;

            state.record(&scene, now, self.room_timeout, self.history_limit);
            (scene, state.triggers.local_direct_urls.clone())
        };

        tracing::info!(scene_id = %scene.scene_id, room_id = %scene.room_id, level = scene.level, "scene selected");
        self.dispatch(&scene);
        self.broadcast(&scene, peers);
        Some(scene.scene_id)
    }

    /// Records a selection made by another local hub and runs its commands
    /// here. Nothing is re-broadcast.
    pub fn apply_peer_selection(&self, scene_id: &str) -> Option<Scene> {
        self.apply_peer_selection_at(scene_id, Instant::now())
    }

    pub fn apply_peer_selection_at(&self, scene_id: &str, now: Instant) -> Option<Scene> {
        let scene = {
            let mut state = self.lock();
            state.purge_expired(now);
            let scene = state.triggers.scene(scene_id).cloned()?;
            state.record(&scene, now, self.room_timeout, self.history_limit);
            scene
        };
        tracing::info!(scene_id = %scene.scene_id, room_id = %scene.room_id, "peer scene selection applied");
        self.dispatch(&scene);
        Some(scene)
    }

    /// True when `message` names a scene this hub already dispatched for
    /// its room, i.e. the platform is echoing our own selection.
    pub fn is_echo(&self, message: &Value) -> bool {
        self.is_echo_at(message, Instant::now())
    }

    pub fn is_echo_at(&self, message: &Value, now: Instant) -> bool {
        let Some(scene_id) = message.get("sceneId").and_then(Value::as_str) else {
            return false;
        };
        let mut state = self.lock();
        state.purge_expired(now);
        match state.triggers.scene(scene_id) {
            Some(scene) => state.in_history(scene),
            None => false,
        }
    }

    /// Forgets everything, on disk and in memory.
    pub fn purge_all(&self) {
        *self.lock() = SceneState::default();
        if let Err(err) = persist::remove_if_exists(&self.path) {
            tracing::warn!(error = %err, "failed to delete scene trigger data");
        }
    }

    pub fn sweep(&self, now: Instant) {
        self.lock().purge_expired(now);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn room(&self, room_id: &str) -> Option<RoomSceneState> {
        self.lock().rooms.get(room_id).cloned()
    }

    fn dispatch(&self, scene: &Scene) {
        for command in &scene.commands {
            self.events.emit_message(command.clone());
        }
    }

    fn broadcast(&self, scene: &Scene, peers: Vec<String>) {
        if peers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available, skipping peer scene broadcast");
            return;
        };
        let announcement = PeerSelection {
            scene_id: scene.scene_id.clone(),
            room_id: scene.room_id.clone(),
            level: scene.level,
        };
        let body = match serde_json::to_vec(&announcement) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode peer scene selection");
                return;
            }
        };
        for peer in peers {
            let http = self.http.clone();
            let body = body.clone();
            let url = format!("{}/scene", peer.trim_end_matches('/'));
            runtime.spawn(async move {
                let result = http
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        tracing::debug!(peer = %url, "scene selection forwarded to peer");
                    }
                    Ok(resp) => {
                        tracing::warn!(peer = %url, status = %resp.status(), "peer rejected scene selection");
                    }
                    Err(err) => {
                        tracing::warn!(peer = %url, error = %err, "failed to forward scene selection");
                    }
                }
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, SceneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
