//! The relay coordinator: one device connection, many sessions.
//!
//! `Relay` wires the device client, the configuration store, the rule
//! engine, and the session registry together. It owns the active
//! profile/rule state and is the single writer of activation flags.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine;
use crate::error::RelayError;
use crate::model::{Action, Profile, ProfileSummary};
use crate::sessions::{
    ClientMessage, ClientRegistry, ConnectionStatus, ObsStatus, RelayErrorReport, ServerMessage,
    SessionId,
};
use crate::store::ConfigStore;
use relay_obs::{ConnectionState, DeviceClient, DeviceNotice};

// ── Relay ────────────────────────────────────────────────────────────

/// Cheaply clonable handle to the relay coordinator.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    store: Arc<dyn ConfigStore>,
    device: DeviceClient,
    registry: ClientRegistry,
    active: RwLock<ActiveState>,
    cancel: CancellationToken,
    task_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The profile the relay currently serves and its loaded rules.
///
/// Replaced wholesale on every switch so a fired rule can never mix
/// the old profile's rules with the new profile's device.
#[derive(Default)]
struct ActiveState {
    profile: Option<Profile>,
    actions: Vec<Action>,
}

impl Relay {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                store,
                device: DeviceClient::new(),
                registry: ClientRegistry::new(),
                active: RwLock::new(ActiveState::default()),
                cancel: CancellationToken::new(),
                task_handles: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the device pumps and dial the stored active profile, if
    /// there is one.
    pub async fn start(&self) -> Result<(), RelayError> {
        self.spawn_task(Self::message_pump(self.clone()));
        self.spawn_task(Self::notice_pump(self.clone()));

        let profiles = self.inner.store.profiles()?;
        if profiles.is_empty() {
            warn!("no connection profiles configured");
            return Ok(());
        }

        let Some(active) = profiles.iter().find(|p| p.active).cloned() else {
            info!(profiles = profiles.len(), "no profile active at startup");
            return Ok(());
        };

        let actions = self.inner.store.actions_for(active.id)?;
        info!(profile = %active.name, rules = actions.len(), "dialing active profile");

        let endpoint = active.endpoint();
        {
            let mut state = self.inner.active.write().await;
            state.profile = Some(active);
            state.actions = actions;
        }
        self.inner.device.connect(endpoint).await;
        Ok(())
    }

    /// Stop the pumps and drop the device connection.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.inner.task_handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "relay task panicked during shutdown");
            }
        }
        self.inner.device.disconnect().await;
        info!("relay stopped");
    }

    fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        if let Ok(mut handles) = self.inner.task_handles.lock() {
            handles.push(handle);
        }
    }

    // ── Profile switching ────────────────────────────────────────────

    /// Activate a profile and redirect the device connection to it.
    ///
    /// The store transaction runs first; when the target is unknown the
    /// relay keeps serving the current profile untouched.
    pub async fn switch_profile(&self, profile_id: Uuid) -> Result<(), RelayError> {
        self.inner.store.activate(profile_id)?;

        let profiles = self.inner.store.profiles()?;
        let target = profiles
            .iter()
            .find(|p| p.id == profile_id)
            .cloned()
            .ok_or(RelayError::ProfileNotFound { id: profile_id })?;
        let actions = self.inner.store.actions_for(profile_id)?;

        info!(profile = %target.name, rules = actions.len(), "switching profile");

        let endpoint = target.endpoint();
        {
            let mut state = self.inner.active.write().await;
            state.profile = Some(target);
            state.actions = actions;
        }
        self.inner.device.connect(endpoint).await;

        self.broadcast_profiles(&profiles);
        Ok(())
    }

    /// Reload the active profile's rules from the store.
    pub async fn refresh_rules(&self) -> Result<(), RelayError> {
        let mut state = self.inner.active.write().await;
        let Some(profile) = &state.profile else {
            return Err(RelayError::NoActiveProfile);
        };
        state.actions = self.inner.store.actions_for(profile.id)?;
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Send one correlated request to the device and await its answer.
    pub async fn dispatch(
        &self,
        request_type: &str,
        request_data: Value,
    ) -> Result<Value, RelayError> {
        Ok(self.inner.device.dispatch(request_type, request_data).await?)
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Attach a control-surface session and send its initial snapshot.
    pub async fn attach_session(
        &self,
    ) -> (SessionId, tokio::sync::mpsc::UnboundedReceiver<ServerMessage>) {
        let (id, rx) = self.inner.registry.register();

        self.inner.registry.send_to(
            id,
            ServerMessage::RelayConnectionStatus(ConnectionStatus::connected(id)),
        );
        self.inner
            .registry
            .send_to(id, ServerMessage::RelayObsStatus(self.obs_status().await));
        if let Ok(profiles) = self.inner.store.profiles() {
            self.inner.registry.send_to(
                id,
                ServerMessage::RelayConnectionProfiles(
                    profiles.iter().map(Profile::summary).collect(),
                ),
            );
        }

        debug!(session = %id, sessions = self.inner.registry.len(), "session attached");
        (id, rx)
    }

    pub fn detach_session(&self, id: SessionId) {
        self.inner.registry.unregister(id);
        debug!(session = %id, sessions = self.inner.registry.len(), "session detached");
    }

    /// Handle one inbound session message.
    pub async fn handle_client_message(&self, session: SessionId, message: ClientMessage) {
        match message {
            ClientMessage::SwitchProfile { id } => {
                if let Err(e) = self.switch_profile(id).await {
                    warn!(session = %session, profile = %id, error = %e, "profile switch rejected");
                    self.inner.registry.send_to(
                        session,
                        ServerMessage::RelayError(RelayErrorReport {
                            message: e.to_string(),
                        }),
                    );
                }
            }
        }
    }

    /// The stored profiles as sessions see them.
    pub fn profile_summaries(&self) -> Result<Vec<ProfileSummary>, RelayError> {
        Ok(self
            .inner
            .store
            .profiles()?
            .iter()
            .map(Profile::summary)
            .collect())
    }

    fn broadcast_profiles(&self, profiles: &[Profile]) {
        self.inner
            .registry
            .broadcast(&ServerMessage::RelayConnectionProfiles(
                profiles.iter().map(Profile::summary).collect(),
            ));
    }

    async fn obs_status(&self) -> ObsStatus {
        let state = self.inner.active.read().await;
        match (&state.profile, self.inner.device.current_state()) {
            (Some(profile), ConnectionState::Identified) => {
                ObsStatus::identified(profile.id, profile.name.clone())
            }
            _ => ObsStatus::idle(),
        }
    }

    // ── Device pumps ─────────────────────────────────────────────────

    /// Forward every device message to sessions, running the rule
    /// engine on events first so a fired rule is never ordered after
    /// the event it reacted to.
    async fn message_pump(self) {
        let mut messages = self.inner.device.messages();
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                received = messages.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "message pump lagged behind the device");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Some(event) = envelope.event() {
                let fired = {
                    let state = self.inner.active.read().await;
                    engine::find_match(&state.actions, &event).cloned()
                };
                if let Some(action) = fired {
                    let device = self.inner.device.clone();
                    let enabled = event.scene_item_enabled();
                    // Steps block on 5s request timeouts; never stall
                    // the pump on them.
                    tokio::spawn(async move {
                        engine::run_steps(&device, &action, enabled).await;
                    });
                }
            }

            match serde_json::to_value(envelope.as_ref()) {
                Ok(value) => self
                    .inner
                    .registry
                    .broadcast(&ServerMessage::ObsMessage(value)),
                Err(e) => warn!(error = %e, "unserializable device message"),
            }
        }
    }

    /// Translate device lifecycle notices into session status messages.
    async fn notice_pump(self) {
        let mut notices = self.inner.device.notices();
        loop {
            let notice = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                received = notices.recv() => match received {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notice pump lagged behind the device");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let status = match notice {
                DeviceNotice::Identified {
                    profile_id,
                    profile_name,
                } => {
                    info!(profile = %profile_name, "device identified");
                    ObsStatus::identified(profile_id, profile_name)
                }
                DeviceNotice::Disconnected {
                    profile_id,
                    profile_name,
                    reason,
                } => {
                    warn!(profile = %profile_name, ?reason, "device disconnected");
                    ObsStatus::disconnected(profile_id, profile_name, &reason)
                }
            };
            self.inner
                .registry
                .broadcast(&ServerMessage::RelayObsStatus(status));
        }
    }
}
