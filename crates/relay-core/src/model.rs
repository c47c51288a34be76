//! Domain entities: endpoint profiles and automation rules.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use relay_obs::Endpoint;

// ── Profiles ─────────────────────────────────────────────────────────

/// A named, storable connection descriptor for one device endpoint.
///
/// At most one profile is active at a time; the switch coordinator is
/// the only writer of the activation flag.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub connection: ConnectionDescriptor,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a profile's device lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub address: Url,
    pub secret: Option<SecretString>,
}

impl Profile {
    pub fn new(name: impl Into<String>, address: Url, secret: Option<SecretString>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            connection: ConnectionDescriptor { address, secret },
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The device endpoint this profile describes.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            profile_id: self.id,
            profile_name: self.name.clone(),
            url: self.connection.address.clone(),
            secret: self.connection.secret.clone(),
        }
    }

    /// The session-facing projection. Never contains the secret.
    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id,
            name: self.name.clone(),
            address: self.connection.address.clone(),
            active: self.active,
        }
    }
}

/// What control-surface sessions see of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: Uuid,
    pub name: String,
    pub address: Url,
    pub active: bool,
}

// ── Automation rules ─────────────────────────────────────────────────

/// An automation rule: device event triggers mapped to command steps.
///
/// A rule applies only while one of its owning profiles is active; the
/// active rule set is replaced wholesale on every profile switch.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub profile_ids: Vec<Uuid>,
    pub enabled: bool,
    pub triggers: Vec<Trigger>,
    pub steps: Vec<CommandStep>,
}

impl Action {
    /// `true` when this rule belongs to the given profile.
    pub fn owned_by(&self, profile_id: Uuid) -> bool {
        self.profile_ids.contains(&profile_id)
    }
}

/// The exact-match tuple a rule fires on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub event_type: String,
    pub item_id: i64,
    pub scene_uuid: String,
}

/// One outbound device command issued when a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStep {
    pub request_type: String,

    /// Static parameters merged into the request, alongside the
    /// event's propagated enabled flag.
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

// ── Tests ────────────────────────────────────────────────────────────
