//! In-memory [`ConfigStore`] backed by a single mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::model::{Action, Profile};
use crate::store::{ConfigStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    profiles: HashMap<Uuid, Profile>,
    // Insertion order is rule evaluation order; first-match-wins
    // depends on it.
    actions: Vec<Action>,
}

/// Mutex-guarded store. Both tables live under one lock so activation
/// is atomic by construction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile, refreshing its update timestamp.
    pub fn upsert_profile(&self, mut profile: Profile) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        profile.updated_at = Utc::now();
        tables.profiles.insert(profile.id, profile);
        Ok(())
    }

    /// Insert an automation rule, or replace it in place so an update
    /// never changes its evaluation position.
    pub fn upsert_action(&self, action: Action) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        match tables.actions.iter_mut().find(|a| a.id == action.id) {
            Some(existing) => *existing = action,
            None => tables.actions.push(action),
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Transaction {
            message: "store lock poisoned".into(),
        })
    }
}

impl ConfigStore for MemoryStore {
    fn profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let tables = self.lock()?;
        let mut profiles: Vec<Profile> = tables.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(profiles)
    }

    fn actions_for(&self, profile_id: Uuid) -> Result<Vec<Action>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .actions
            .iter()
            .filter(|action| action.owned_by(profile_id))
            .cloned()
            .collect())
    }

    fn activate(&self, profile_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.lock()?;

        // Validate before touching any flag.
        if !tables.profiles.contains_key(&profile_id) {
            return Err(StoreError::ProfileNotFound { id: profile_id });
        }

        let now = Utc::now();
        for profile in tables.profiles.values_mut() {
            let target = profile.id == profile_id;
            if profile.active != target {
                profile.active = target;
                profile.updated_at = now;
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use url::Url;

    fn profile(name: &str) -> Profile {
        Profile::new(name, Url::parse("ws://localhost:4455").expect("url"), None)
    }

    #[test]
    fn activate_is_exclusive() {
        let store = MemoryStore::new();
        let a = profile("a");
        let b = profile("b");
        let (a_id, b_id) = (a.id, b.id);
        store.upsert_profile(a).expect("upsert");
        store.upsert_profile(b).expect("upsert");

        store.activate(a_id).expect("activate a");
        store.activate(b_id).expect("activate b");

        let profiles = store.profiles().expect("profiles");
        let active: Vec<Uuid> = profiles.iter().filter(|p| p.active).map(|p| p.id).collect();
        assert_eq!(active, vec![b_id]);
    }

    #[test]
    fn activate_unknown_profile_changes_nothing() {
        let store = MemoryStore::new();
        let a = profile("a");
        let a_id = a.id;
        store.upsert_profile(a).expect("upsert");
        store.activate(a_id).expect("activate");

        let err = store.activate(Uuid::new_v4()).expect_err("must fail");
        assert!(matches!(err, StoreError::ProfileNotFound { .. }));

        let profiles = store.profiles().expect("profiles");
        assert!(profiles.iter().any(|p| p.id == a_id && p.active));
    }

    #[test]
    fn actions_keep_insertion_order_not_name_order() {
        let store = MemoryStore::new();
        let p = profile("p");
        let p_id = p.id;
        store.upsert_profile(p).expect("upsert");

        let action = |name: &str| Action {
            id: Uuid::new_v4(),
            name: name.into(),
            profile_ids: vec![p_id],
            enabled: true,
            triggers: vec![crate::model::Trigger {
                event_type: "SceneItemEnableStateChanged".into(),
                item_id: 4,
                scene_uuid: "scene-1".into(),
            }],
            steps: vec![],
        };

        // Names deliberately reversed against insertion order.
        store.upsert_action(action("zz-inserted-first")).expect("upsert");
        store.upsert_action(action("aa-inserted-second")).expect("upsert");

        let actions = store.actions_for(p_id).expect("actions");
        let names: Vec<&str> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["zz-inserted-first", "aa-inserted-second"]);

        // First-match-wins therefore fires the earlier insertion.
        let event: relay_obs::EventPayload = serde_json::from_value(serde_json::json!({
            "eventType": "SceneItemEnableStateChanged",
            "eventData": {"sceneItemId": 4, "sceneUuid": "scene-1"}
        }))
        .expect("event");
        let fired = crate::engine::find_match(&actions, &event).expect("match");
        assert_eq!(fired.name, "zz-inserted-first");
    }

    #[test]
    fn replacing_an_action_keeps_its_evaluation_position() {
        let store = MemoryStore::new();
        let p = profile("p");
        let p_id = p.id;
        store.upsert_profile(p).expect("upsert");

        let first = Action {
            id: Uuid::new_v4(),
            name: "first".into(),
            profile_ids: vec![p_id],
            enabled: true,
            triggers: vec![],
            steps: vec![],
        };
        let first_id = first.id;
        let second = Action {
            id: Uuid::new_v4(),
            name: "second".into(),
            profile_ids: vec![p_id],
            enabled: true,
            triggers: vec![],
            steps: vec![],
        };
        store.upsert_action(first.clone()).expect("upsert");
        store.upsert_action(second).expect("upsert");

        store
            .upsert_action(Action {
                name: "first-renamed".into(),
                ..first
            })
            .expect("replace");

        let actions = store.actions_for(p_id).expect("actions");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].id, first_id);
        assert_eq!(actions[0].name, "first-renamed");
    }

    #[test]
    fn actions_are_scoped_to_their_profile() {
        let store = MemoryStore::new();
        let a = profile("a");
        let b = profile("b");
        let (a_id, b_id) = (a.id, b.id);
        store.upsert_profile(a).expect("upsert");
        store.upsert_profile(b).expect("upsert");

        let action = Action {
            id: Uuid::new_v4(),
            name: "only for a".into(),
            profile_ids: vec![a_id],
            enabled: true,
            triggers: vec![],
            steps: vec![],
        };
        store.upsert_action(action).expect("upsert");

        assert_eq!(store.actions_for(a_id).expect("actions").len(), 1);
        assert!(store.actions_for(b_id).expect("actions").is_empty());
    }
}
