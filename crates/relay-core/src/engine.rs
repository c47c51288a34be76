//! Rule-matching engine for device events.
//!
//! Evaluation is first-match-wins over the active rule list in stored
//! order; at most one rule fires per event. The fired rule's command
//! steps run sequentially, and a failed step never aborts the rest.

use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{Action, CommandStep};
use relay_obs::{DeviceClient, EventPayload};

/// Find the first enabled rule with a trigger matching the event.
///
/// A trigger matches on the exact (event type, item id, scene uuid)
/// tuple; events missing any of those fields match nothing.
pub fn find_match<'a>(actions: &'a [Action], event: &EventPayload) -> Option<&'a Action> {
    let item_id = event.scene_item_id()?;
    let scene_uuid = event.scene_uuid()?;

    actions.iter().find(|action| {
        action.enabled
            && action.triggers.iter().any(|trigger| {
                trigger.event_type == event.event_type
                    && trigger.item_id == item_id
                    && trigger.scene_uuid == scene_uuid
            })
    })
}

/// Run every step of a fired rule against the device, in order.
///
/// The event's enabled flag is merged into each step's settings so
/// commands can mirror the source item's new state. Step failures are
/// logged and skipped.
pub async fn run_steps(device: &DeviceClient, action: &Action, scene_item_enabled: Option<bool>) {
    debug!(action = %action.name, steps = action.steps.len(), "running rule steps");

    for step in &action.steps {
        let settings = merge_settings(step, scene_item_enabled);

        if let Err(error) = device
            .dispatch(&step.request_type, Value::Object(settings))
            .await
        {
            warn!(
                action = %action.name,
                request_type = %step.request_type,
                %error,
                "rule step failed"
            );
        }
    }
}

/// A step's static settings plus the event's propagated enabled flag.
/// The flag overwrites any static value of the same name.
fn merge_settings(
    step: &CommandStep,
    scene_item_enabled: Option<bool>,
) -> serde_json::Map<String, Value> {
    let mut settings = step.settings.clone();
    if let Some(enabled) = scene_item_enabled {
        settings.insert("sceneItemEnabled".into(), Value::Bool(enabled));
    }
    settings
}

// ── Tests ────────────────────────────────────────────────────────────
