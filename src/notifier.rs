//! §4.7 Notification Batcher: coalesces ad-hoc roster churn into debounced
//! edits, built on the shared [`crate::scheduler::KeyedTimers`] abstraction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::model::{DiscordId, EventId};
use crate::ports::{NotificationPayload, NotificationSender};
use crate::scheduler::KeyedTimers;
use crate::utils::prelude::*;

const UPDATE_DEBOUNCE: Duration = Duration::from_secs(10);

/// What the batcher needs to re-render a session at fire time. The engine
/// refreshes this on every `queue_update` call so the timer callback always
/// sees the latest roster even though it was armed earlier.
#[derive(Debug, Clone)]
pub struct PendingRender {
    pub game_name: String,
    pub member_names: Vec<String>,
}

struct SessionState {
    message_id: Option<String>,
}

/// Owns per-session debounce timers and the known message-id for each
/// in-flight ad-hoc session, so updates can be rendered as edits.
pub struct NotificationBatcher {
    sender: Arc<dyn NotificationSender>,
    timers: KeyedTimers<EventId>,
    sessions: DashMap<EventId, SessionState>,
    pending: DashMap<EventId, PendingRender>,
    notify_channel_id: DashMap<EventId, DiscordId>,
}

impl NotificationBatcher {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Arc<Self> {
        Arc::new(Self {
            sender,
            timers: KeyedTimers::new(),
            sessions: DashMap::new(),
            pending: DashMap::new(),
            notify_channel_id: DashMap::new(),
        })
    }

    /// Spawn notification: always renders synchronously and records the
    /// resulting message id for subsequent edits (§4.5 "Spawn").
    pub async fn notify_spawned(
        self: &Arc<Self>,
        notify_channel_id: DiscordId,
        event_id: EventId,
        game_name: String,
        member_names: Vec<String>,
    ) {
        self.notify_channel_id.insert(event_id, notify_channel_id);

        match self
            .sender
            .send_or_edit(
                notify_channel_id,
                None,
                NotificationPayload::Spawned {
                    event_id,
                    game_name,
                    member_names,
                },
            )
            .await
        {
            Ok(message_id) => {
                self.sessions.insert(event_id, SessionState {
                    message_id: Some(message_id),
                });
            },
            Err(e) => {
                warn!("Spawn notification failed for event '{event_id}': {e:#}");
                self.sessions.insert(event_id, SessionState { message_id: None });
            },
        }
    }

    /// Roster churn on an active session (§4.5 "Update notification
    /// coalescing"): arms or extends the 10s debounce and remembers the
    /// latest snapshot to render once it fires.
    pub fn queue_update(self: &Arc<Self>, notify_channel_id: DiscordId, event_id: EventId, render: PendingRender) {
        self.notify_channel_id.insert(event_id, notify_channel_id);
        self.pending.insert(event_id, render);

        let this = Arc::clone(self);
        self.timers.arm(event_id, UPDATE_DEBOUNCE, move || async move {
            this.fire_update(event_id).await;
        });
    }

    async fn fire_update(self: Arc<Self>, event_id: EventId) {
        let Some((_, render)) = self.pending.remove(&event_id) else {
            return;
        };
        let Some(channel_id) = self.notify_channel_id.get(&event_id).map(|v| *v) else {
            return;
        };

        let message_id = self.sessions.get(&event_id).and_then(|s| s.message_id.clone());

        match self
            .sender
            .send_or_edit(
                channel_id,
                message_id,
                NotificationPayload::Updated {
                    event_id,
                    game_name: render.game_name,
                    member_names: render.member_names,
                },
            )
            .await
        {
            Ok(message_id) => {
                self.sessions.insert(event_id, SessionState {
                    message_id: Some(message_id),
                });
            },
            Err(e) => warn!("Update render failed for event '{event_id}', dropping: {e:#}"),
        }
    }

    /// Completion (§4.5): cancel any pending update and render synchronously.
    pub async fn notify_completed(
        self: &Arc<Self>,
        event_id: EventId,
        game_name: String,
        durations: Vec<(String, i64)>,
    ) {
        self.timers.cancel(&event_id);
        self.pending.remove(&event_id);

        let Some(channel_id) = self.notify_channel_id.remove(&event_id).map(|(_, v)| v) else {
            warn!("No known notification channel for completed event '{event_id}'");
            return;
        };

        let message_id = self
            .sessions
            .remove(&event_id)
            .and_then(|(_, s)| s.message_id);

        if let Err(e) = self
            .sender
            .send_or_edit(
                channel_id,
                message_id,
                NotificationPayload::Completed {
                    event_id,
                    game_name,
                    durations,
                },
            )
            .await
        {
            warn!("Completion render failed for event '{event_id}': {e:#}");
        }
    }
}
