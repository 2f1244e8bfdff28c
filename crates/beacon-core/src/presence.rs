//! Presence set synchronization.
//!
//! The server reports per-topic membership with a full `presence_state`
//! snapshot followed by incremental `presence_diff` updates. A member id maps
//! to one meta record per session; sessions are told apart by their `phx_ref`.

use beacon_protocol::events::{event, PRESENCE_REF_KEY};
use beacon_protocol::{Envelope, Payload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// One session record of a member.
pub type Meta = Payload;

/// Member id to session records.
pub type PresenceMap = HashMap<String, Vec<Meta>>;

/// Hook fired per joined or left meta.
pub type MetaHook = Arc<dyn Fn(&str, &Meta) + Send + Sync>;

/// Hook fired with the full state after a change.
pub type StateHook = Arc<dyn Fn(&PresenceMap) + Send + Sync>;

const COUNT_CAPACITY: usize = 16;

/// How a `presence_state` snapshot treats ids it does not mention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Keep unmentioned ids.
    #[default]
    Merge,
    /// Drop unmentioned ids.
    Replace,
}

/// When a `presence_diff` notifies state observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffNotify {
    /// Only when the number of ids changed.
    #[default]
    OnCountChange,
    /// After every diff.
    Always,
}

/// Presence synchronization settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Snapshot handling.
    pub snapshot: SnapshotPolicy,
    /// Diff notification.
    pub diff_notify: DiffNotify,
}

/// A change produced by applying a presence envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// A session joined.
    Join {
        /// Member id.
        id: String,
        /// The appended meta.
        meta: Meta,
    },
    /// A session left.
    Leave {
        /// Member id.
        id: String,
        /// The removed meta.
        meta: Meta,
    },
    /// The state changed.
    StateChange(PresenceMap),
}

/// Presence observers.
#[derive(Clone, Default)]
pub struct PresenceHooks {
    /// Fired per appended meta.
    pub on_join: Option<MetaHook>,
    /// Fired per removed meta.
    pub on_leave: Option<MetaHook>,
    /// Fired with the full state.
    pub on_state_change: Option<StateHook>,
}

impl PresenceHooks {
    /// Deliver events to the registered hooks.
    pub fn dispatch(&self, events: &[PresenceEvent]) {
        for event in events {
            match event {
                PresenceEvent::Join { id, meta } => {
                    if let Some(hook) = &self.on_join {
                        hook(id, meta);
                    }
                }
                PresenceEvent::Leave { id, meta } => {
                    if let Some(hook) = &self.on_leave {
                        hook(id, meta);
                    }
                }
                PresenceEvent::StateChange(state) => {
                    if let Some(hook) = &self.on_state_change {
                        hook(state);
                    }
                }
            }
        }
    }
}

/// The synchronized member set of one topic.
#[derive(Clone)]
pub struct Presence {
    state: PresenceMap,
    config: PresenceConfig,
    hooks: PresenceHooks,
    count_tx: broadcast::Sender<usize>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    /// Create an empty set with default policies.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    /// Create an empty set.
    #[must_use]
    pub fn with_config(config: PresenceConfig) -> Self {
        let (count_tx, _) = broadcast::channel(COUNT_CAPACITY);
        Self {
            state: PresenceMap::new(),
            config,
            hooks: PresenceHooks::default(),
            count_tx,
        }
    }

    /// Register the join hook.
    pub fn on_join<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&str, &Meta) + Send + Sync + 'static,
    {
        self.hooks.on_join = Some(Arc::new(hook));
        self
    }

    /// Register the leave hook.
    pub fn on_leave<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&str, &Meta) + Send + Sync + 'static,
    {
        self.hooks.on_leave = Some(Arc::new(hook));
        self
    }

    /// Register the state change hook.
    pub fn on_state_change<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&PresenceMap) + Send + Sync + 'static,
    {
        self.hooks.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Registered hooks.
    #[must_use]
    pub fn hooks(&self) -> PresenceHooks {
        self.hooks.clone()
    }

    /// Remove every hook.
    pub fn clear_hooks(&mut self) {
        self.hooks = PresenceHooks::default();
    }

    /// Apply a presence envelope and fire hooks.
    pub fn sync(&mut self, envelope: &Envelope) {
        let events = self.apply(envelope);
        self.hooks.clone().dispatch(&events);
    }

    /// Apply a presence envelope and return what changed, without firing
    /// hooks. Envelopes with other events are ignored.
    pub fn apply(&mut self, envelope: &Envelope) -> Vec<PresenceEvent> {
        match envelope.event.as_str() {
            event::PRESENCE_STATE => self.apply_state(&envelope.payload),
            event::PRESENCE_DIFF => self.apply_diff(&envelope.payload),
            _ => Vec::new(),
        }
    }

    fn apply_state(&mut self, payload: &Payload) -> Vec<PresenceEvent> {
        if self.config.snapshot == SnapshotPolicy::Replace {
            self.state.clear();
        }

        for (id, entry) in payload {
            if let Some(metas) = metas_of(entry) {
                if metas.is_empty() {
                    self.state.remove(id);
                } else {
                    self.state.insert(id.clone(), metas);
                }
            }
        }

        trace!(members = self.state.len(), "Applied presence state");
        self.refresh_count();
        vec![PresenceEvent::StateChange(self.state.clone())]
    }

    fn apply_diff(&mut self, payload: &Payload) -> Vec<PresenceEvent> {
        let before = self.state.len();
        let mut events = Vec::new();

        if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
            for (id, entry) in leaves {
                let metas = metas_of(entry).unwrap_or_default();
                self.leave(id, &metas, &mut events);
            }
        }

        if let Some(joins) = payload.get("joins").and_then(Value::as_object) {
            for (id, entry) in joins {
                let metas = metas_of(entry).unwrap_or_default();
                self.join(id, metas, &mut events);
            }
        }

        let changed = self.state.len() != before;
        trace!(
            members = self.state.len(),
            changed,
            "Applied presence diff"
        );

        if changed || self.config.diff_notify == DiffNotify::Always {
            self.refresh_count();
            events.push(PresenceEvent::StateChange(self.state.clone()));
        }
        events
    }

    fn leave(&mut self, id: &str, leaving: &[Meta], events: &mut Vec<PresenceEvent>) {
        let Some(current) = self.state.get_mut(id) else {
            return;
        };

        if current.len() == 1 {
            if let Some(metas) = self.state.remove(id) {
                events.extend(metas.into_iter().map(|meta| PresenceEvent::Leave {
                    id: id.to_string(),
                    meta,
                }));
            }
            return;
        }

        let refs: HashSet<&str> = leaving.iter().filter_map(presence_ref).collect();
        let (removed, kept): (Vec<Meta>, Vec<Meta>) = std::mem::take(current)
            .into_iter()
            .partition(|meta| presence_ref(meta).is_some_and(|r| refs.contains(r)));

        if kept.is_empty() {
            self.state.remove(id);
        } else {
            *current = kept;
        }

        events.extend(removed.into_iter().map(|meta| PresenceEvent::Leave {
            id: id.to_string(),
            meta,
        }));
    }

    fn join(&mut self, id: &str, joining: Vec<Meta>, events: &mut Vec<PresenceEvent>) {
        if joining.is_empty() {
            return;
        }

        events.extend(joining.iter().map(|meta| PresenceEvent::Join {
            id: id.to_string(),
            meta: meta.clone(),
        }));
        self.state.entry(id.to_string()).or_default().extend(joining);
    }

    fn refresh_count(&self) {
        // No receivers is fine.
        let _ = self.count_tx.send(self.state.len());
    }

    /// Session records of a member.
    #[must_use]
    pub fn metas(&self, id: &str) -> Option<&[Meta]> {
        self.state.get(id).map(Vec::as_slice)
    }

    /// The first session record of a member.
    #[must_use]
    pub fn first_meta(&self, id: &str) -> Option<&Meta> {
        self.state.get(id).and_then(|metas| metas.first())
    }

    /// The first session record of every member.
    #[must_use]
    pub fn first_metas(&self) -> HashMap<String, Meta> {
        self.state
            .iter()
            .filter_map(|(id, metas)| metas.first().map(|meta| (id.clone(), meta.clone())))
            .collect()
    }

    /// A key of a member's first session record, decoded as `T`.
    #[must_use]
    pub fn first_meta_value<T: DeserializeOwned>(&self, id: &str, key: &str) -> Option<T> {
        let value = self.first_meta(id)?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// A key of every member's first session record, decoded as `T`.
    ///
    /// Members whose value is missing or of another type are skipped.
    #[must_use]
    pub fn first_meta_values<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.state
            .values()
            .filter_map(|metas| metas.first()?.get(key))
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    /// Number of distinct members.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.len()
    }

    /// Member ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.state.keys().cloned().collect()
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// The full state.
    #[must_use]
    pub fn state(&self) -> &PresenceMap {
        &self.state
    }

    /// Subscribe to member count refreshes.
    #[must_use]
    pub fn subscribe_count(&self) -> broadcast::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

fn metas_of(entry: &Value) -> Option<Vec<Meta>> {
    let metas = entry.get("metas")?.as_array()?;
    Some(
        metas
            .iter()
            .filter_map(|meta| meta.as_object().cloned())
            .collect(),
    )
}

fn presence_ref(meta: &Meta) -> Option<&str> {
    meta.get(PRESENCE_REF_KEY).and_then(Value::as_str)
}
