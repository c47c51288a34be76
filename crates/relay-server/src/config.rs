//! TOML configuration: figment loading and store seeding.
//!
//! The file declares the listen address, the optional session token,
//! and the profiles and automation rules the relay serves. Environment
//! variables prefixed `RELAY_` override file values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use relay_core::{Action, CommandStep, ConfigStore, MemoryStore, Profile, Trigger};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the session listener binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Shared token sessions must present as `?token=` on connect.
    /// Absent means unauthenticated sessions are accepted.
    pub auth_token: Option<String>,

    /// Device connection profiles.
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,

    /// Automation rules, referencing profiles by name.
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_token: None,
            profiles: Vec::new(),
            actions: Vec::new(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4456))
}

/// One device profile as written in TOML.
#[derive(Debug, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub name: String,

    /// Device WebSocket URL, e.g. "ws://192.168.1.20:4455".
    pub address: String,

    /// Device password for challenge-response auth.
    pub password: Option<String>,

    /// Dial this profile at startup. At most one profile should set it.
    #[serde(default)]
    pub active: bool,
}

/// One automation rule as written in TOML.
#[derive(Debug, Deserialize, Serialize)]
pub struct ActionConfig {
    pub name: String,

    /// Names of the profiles this rule belongs to.
    pub profiles: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TriggerConfig {
    pub event_type: String,
    pub item_id: i64,
    pub scene_uuid: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StepConfig {
    pub request_type: String,

    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "obs-relay", "obs-relay").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("obs-relay");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full config from file + environment.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(ServerConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("RELAY_").ignore(&["CONFIG"]));

    let config: ServerConfig = figment.extract()?;
    Ok(config)
}

// ── Store seeding ───────────────────────────────────────────────────

/// Build the in-memory store from the declared profiles and rules.
///
/// Rules referencing unknown profile names are rejected. When several
/// profiles claim `active`, the first one wins.
pub fn seed_store(config: &ServerConfig) -> Result<Arc<MemoryStore>, ConfigError> {
    let store = Arc::new(MemoryStore::new());

    let mut active_id = None;
    let mut ids_by_name = std::collections::HashMap::new();

    for profile_cfg in &config.profiles {
        let address: Url = profile_cfg
            .address
            .parse()
            .map_err(|_| ConfigError::Validation {
                field: format!("profiles.{}.address", profile_cfg.name),
                reason: format!("invalid URL: {}", profile_cfg.address),
            })?;

        let secret = profile_cfg
            .password
            .clone()
            .map(SecretString::from);
        let profile = Profile::new(profile_cfg.name.clone(), address, secret);

        if ids_by_name
            .insert(profile_cfg.name.clone(), profile.id)
            .is_some()
        {
            return Err(ConfigError::Validation {
                field: "profiles".into(),
                reason: format!("duplicate profile name '{}'", profile_cfg.name),
            });
        }

        if profile_cfg.active {
            if active_id.is_none() {
                active_id = Some(profile.id);
            } else {
                warn!(profile = %profile_cfg.name, "ignoring extra active flag");
            }
        }

        store
            .upsert_profile(profile)
            .map_err(|e| ConfigError::Validation {
                field: "profiles".into(),
                reason: e.to_string(),
            })?;
    }

    for action_cfg in &config.actions {
        let mut profile_ids = Vec::with_capacity(action_cfg.profiles.len());
        for name in &action_cfg.profiles {
            let id = ids_by_name
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::Validation {
                    field: format!("actions.{}.profiles", action_cfg.name),
                    reason: format!("unknown profile '{name}'"),
                })?;
            profile_ids.push(id);
        }

        let action = Action {
            id: uuid::Uuid::new_v4(),
            name: action_cfg.name.clone(),
            profile_ids,
            enabled: action_cfg.enabled,
            triggers: action_cfg
                .triggers
                .iter()
                .map(|t| Trigger {
                    event_type: t.event_type.clone(),
                    item_id: t.item_id,
                    scene_uuid: t.scene_uuid.clone(),
                })
                .collect(),
            steps: action_cfg
                .steps
                .iter()
                .map(|s| CommandStep {
                    request_type: s.request_type.clone(),
                    settings: s.settings.clone(),
                })
                .collect(),
        };
        store
            .upsert_action(action)
            .map_err(|e| ConfigError::Validation {
                field: "actions".into(),
                reason: e.to_string(),
            })?;
    }

    if let Some(id) = active_id {
        store.activate(id).map_err(|e| ConfigError::Validation {
            field: "profiles".into(),
            reason: e.to_string(),
        })?;
    }

    Ok(store)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relay_core::ConfigStore;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn loads_profiles_and_rules_from_toml() {
        let file = write_config(
            r#"
            listen = "127.0.0.1:9100"
            auth_token = "shh"

            [[profiles]]
            name = "Studio"
            address = "ws://127.0.0.1:4455"
            password = "hunter2"
            active = true

            [[profiles]]
            name = "Travel"
            address = "ws://10.0.0.9:4455"

            [[actions]]
            name = "Mirror camera"
            profiles = ["Studio"]

            [[actions.triggers]]
            event_type = "SceneItemEnableStateChanged"
            item_id = 4
            scene_uuid = "scene-1"

            [[actions.steps]]
            request_type = "SetSceneItemEnabled"
            settings = { sceneName = "Main", sceneItemId = 9 }
            "#,
        );

        let config = load_config(file.path()).expect("load");
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.auth_token.as_deref(), Some("shh"));
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.actions.len(), 1);
        assert_eq!(config.actions[0].triggers.len(), 1);

        let store = seed_store(&config).expect("seed");
        let profiles = store.profiles().expect("profiles");
        assert_eq!(profiles.len(), 2);
        let active = profiles.iter().find(|p| p.active).expect("active profile");
        assert_eq!(active.name, "Studio");

        let actions = store.actions_for(active.id).expect("actions");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].steps[0].request_type, "SetSceneItemEnabled");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load");
        assert_eq!(config.listen, default_listen());
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn rule_referencing_unknown_profile_is_rejected() {
        let file = write_config(
            r#"
            [[profiles]]
            name = "Studio"
            address = "ws://127.0.0.1:4455"

            [[actions]]
            name = "Orphan"
            profiles = ["Nope"]
            "#,
        );
        let config = load_config(file.path()).expect("load");
        let err = seed_store(&config).expect_err("must fail");
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn invalid_device_url_is_rejected() {
        let file = write_config(
            r#"
            [[profiles]]
            name = "Broken"
            address = "not a url"
            "#,
        );
        let config = load_config(file.path()).expect("load");
        assert!(seed_store(&config).is_err());
    }
}
