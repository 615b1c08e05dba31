//! Fire-and-forget delivery to the external notification sink.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::AppState;

/// Hand `(recipient, template, variables)` to the notification sink without
/// blocking the caller. Delivery failures are logged and otherwise ignored.
pub fn notify(state: &AppState, recipient_id: Uuid, template: &str, variables: Value) {
    let Some(url) = state.settings.notification_sink_url.clone() else {
        tracing::debug!(%recipient_id, template, "no notification sink configured");
        return;
    };
    let http = state.http.clone();
    let template = template.to_string();
    let payload = json!({
        "recipientId": recipient_id,
        "template": template,
        "variables": variables,
    });
    tokio::spawn(async move {
        if let Err(e) = http.post(&url).json(&payload).send().await {
            tracing::debug!(template, "notification delivery failed: {e}");
        }
    });
}
