use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::envelope::{Envelope, ErrorCode};
use parley_types::models::{ChatMessage, Peer, UserSettings, trim_to_micros};

use crate::error::CommandError;
use crate::registry::Session;
use crate::state::GatewayState;

/// Act on one decoded client envelope. Refusals are answered with an
/// `Error` envelope on the same session and never end the connection.
pub async fn handle_command(state: &GatewayState, session: &Session, envelope: Envelope) {
    let kind = envelope.kind();
    debug!("{} ({}) -> {}", session.username(), session.user_id(), kind);

    let result = match envelope {
        Envelope::Subscribe { peer } => subscribe(state, session, peer).await,

        Envelope::Unsubscribe { peer } => {
            state.registry.unsubscribe(session.id(), peer);
            Ok(())
        }

        Envelope::SendMessage { peer, body } => send_message(state, session, peer, body).await,

        Envelope::SettingsUpdate { peer, settings } => {
            update_settings(state, session, peer, settings).await
        }

        Envelope::Ack {
            peer, message_id, ..
        } => ack(state, session, peer, message_id),

        Envelope::ScheduleMessage {
            peer,
            body,
            scheduled_at,
        } => schedule(state, session, peer, body, scheduled_at).await,

        Envelope::CancelScheduled { id } => cancel(state, session, id).await,

        Envelope::Identify { .. } => Err(CommandError::Refused(
            ErrorCode::BadRequest,
            "session is already identified",
        )),

        Envelope::Ready { .. }
        | Envelope::ChatMessage(_)
        | Envelope::ScheduledUpdate(_)
        | Envelope::Error { .. } => Err(CommandError::Refused(
            ErrorCode::BadRequest,
            "envelope is server-only",
        )),
    };

    if let Err(e) = result {
        let code = e.code();
        if code == ErrorCode::Internal {
            warn!("{} ({}) {} failed: {}", session.username(), session.user_id(), kind, e);
        } else {
            debug!("{} ({}) {} refused: {}", session.username(), session.user_id(), kind, e);
        }
        let _ = state
            .registry
            .send(session.id(), &Envelope::error(code, e.client_message()));
    }
}

async fn subscribe(state: &GatewayState, session: &Session, peer: Peer) -> Result<(), CommandError> {
    let user_id = session.user_id();
    let allowed = match peer {
        Peer::User(id) => id == user_id,
        Peer::Thread(thread_id) => {
            with_db(state, move |db| db.is_thread_member(thread_id, user_id)).await?
        }
    };
    if !allowed {
        return Err(CommandError::Refused(
            ErrorCode::Forbidden,
            "not allowed to subscribe to this conversation",
        ));
    }

    if !state.registry.subscribe(session.id(), peer) {
        return Ok(());
    }
    info!("{} ({}) subscribed to {}", session.username(), user_id, peer);

    if let Some(settings) = with_db(state, move |db| db.get_settings(user_id, &peer)).await? {
        let _ = state
            .registry
            .send(session.id(), &Envelope::SettingsUpdate { peer, settings });
    }
    Ok(())
}

async fn send_message(
    state: &GatewayState,
    session: &Session,
    peer: Peer,
    body: String,
) -> Result<(), CommandError> {
    let message = ChatMessage {
        id: Uuid::new_v4(),
        peer,
        author_id: session.user_id(),
        body,
        sent_at: trim_to_micros(Utc::now()),
    };

    let row = message.clone();
    with_db(state, move |db| db.insert_message(&row)).await?;

    state.dispatcher.publish_message(&message)?;
    Ok(())
}

async fn update_settings(
    state: &GatewayState,
    session: &Session,
    peer: Peer,
    settings: UserSettings,
) -> Result<(), CommandError> {
    let user_id = session.user_id();
    with_db(state, move |db| db.upsert_settings(user_id, &peer, &settings)).await?;

    info!(
        "{} ({}) set {:?} notifications for {}",
        session.username(),
        user_id,
        settings.mode,
        peer
    );
    state
        .dispatcher
        .publish_to_user(user_id, &Envelope::SettingsUpdate { peer, settings })?;
    Ok(())
}

fn ack(state: &GatewayState, session: &Session, peer: Peer, message_id: Uuid) -> Result<(), CommandError> {
    if !state.registry.is_subscribed(session.id(), &peer) {
        return Err(CommandError::Refused(
            ErrorCode::Forbidden,
            "not subscribed to this conversation",
        ));
    }

    // The acknowledging user comes from the session, not the frame.
    state.dispatcher.publish(
        &peer,
        &Envelope::Ack {
            peer,
            message_id,
            user_id: session.user_id(),
        },
    )?;
    Ok(())
}

async fn schedule(
    state: &GatewayState,
    session: &Session,
    peer: Peer,
    body: String,
    scheduled_at: DateTime<Utc>,
) -> Result<(), CommandError> {
    let item = state
        .scheduler
        .schedule(session.user_id(), peer, body, scheduled_at)
        .await?;
    state
        .dispatcher
        .publish_to_user(session.user_id(), &Envelope::ScheduledUpdate(item))?;
    Ok(())
}

async fn cancel(state: &GatewayState, session: &Session, id: Uuid) -> Result<(), CommandError> {
    let item = state.scheduler.cancel(session.user_id(), id).await?;
    state
        .dispatcher
        .publish_to_user(session.user_id(), &Envelope::ScheduledUpdate(item))?;
    Ok(())
}

async fn with_db<T, F>(state: &GatewayState, f: F) -> Result<T, CommandError>
where
    F: FnOnce(&Database) -> parley_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db: Arc<Database> = state.db.clone();
    Ok(spawn_blocking(move || f(&db)).await??)
}
