//! Outbound delivery and background maintenance tasks

use crate::dispatch::DispatchOutcome;
use crate::protocol::Envelope;
use crate::state::{AppState, Audience, Recipient};
use crate::types::ConnectionId;
use std::sync::Arc;

/// How many connections each part of an outcome was queued for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub primary_recipients: usize,
    pub update_recipients: usize,
}

/// Queue one frame for every recipient; failures are logged and skipped
fn send_all(recipients: &[Recipient], envelope: &Envelope) -> usize {
    let frame: Arc<str> = Arc::from(envelope.to_json());
    recipients
        .iter()
        .filter(|recipient| match recipient.send(frame.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Dropping {} for {}: {}",
                    envelope.message.type_name(),
                    recipient.connection_id,
                    e
                );
                false
            }
        })
        .count()
}

/// Send every connection a frame
pub fn broadcast_all(state: &AppState, envelope: &Envelope) -> usize {
    send_all(&state.connections.recipients(Audience::All), envelope)
}

/// Send every member of a session a frame
pub fn broadcast_to_session(state: &AppState, session_id: &str, envelope: &Envelope) -> usize {
    send_all(
        &state.connections.recipients(Audience::Session(session_id)),
        envelope,
    )
}

/// Route a dispatch outcome.
///
/// The primary reply goes back to `origin`, or to everyone when the request
/// asked for a broadcast. The contextual update goes to the members of
/// `target_session`; with no session known it goes to everyone. An origin
/// that has already disconnected just misses its reply.
pub fn deliver(
    state: &AppState,
    origin: &ConnectionId,
    outcome: &DispatchOutcome,
    target_session: Option<&str>,
) -> DeliveryReport {
    let primary_recipients = if outcome.broadcast {
        broadcast_all(state, &outcome.primary)
    } else {
        match state.connections.recipient(origin) {
            Some(recipient) => send_all(&[recipient], &outcome.primary),
            None => {
                tracing::debug!(
                    "Origin {} is gone; dropping {}",
                    origin,
                    outcome.primary.message.type_name()
                );
                0
            }
        }
    };

    let update_recipients = match &outcome.contextual_update {
        Some(update) => match target_session {
            Some(session_id) => broadcast_to_session(state, session_id, update),
            None => broadcast_all(state, update),
        },
        None => 0,
    };

    DeliveryReport {
        primary_recipients,
        update_recipients,
    }
}

/// Spawn a background task that drops idle sessions
pub fn spawn_session_reaper(state: Arc<AppState>) {
    let interval = state.sessions.config().reap_interval;
    let max_age = state.sessions.config().max_age;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let reaped = state.sessions.reap(max_age);
            if reaped > 0 {
                tracing::info!(
                    "Reaped {} idle sessions ({} remaining)",
                    reaped,
                    state.sessions.len()
                );
            }
        }
    });
}
