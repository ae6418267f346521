use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::UserProfile;

use crate::dispatcher::Dispatcher;
use crate::typing::{self, TypingOutcome, TypingTarget};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The credential was
/// already verified at the HTTP upgrade layer, so the session goes straight
/// to Ready + event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    profile: UserProfile,
) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = profile.uuid;
    let name = profile.name.clone();

    info!("{} ({}) connected to gateway", name, user_id);

    let ready = GatewayEvent::Ready { user: profile };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (conn_id, mut user_rx) = dispatcher.register_session(user_id);

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let name_recv = name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db_recv, user_id, &name_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!("{} ({}) bad command: {}", name_recv, user_id, e);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Fire-and-forget last-seen update once the final session is gone; never
    // part of any message/receipt transaction.
    if dispatcher.unregister_session(user_id, conn_id) {
        let db = db.clone();
        tokio::task::spawn_blocking(move || {
            let result = db.with_conn(|conn| {
                parley_db::queries::touch_last_seen(
                    conn,
                    &user_id.to_string(),
                    &parley_db::now_rfc3339(),
                )
            });
            if let Err(e) = result {
                warn!("Failed to record last-seen for {}: {}", user_id, e);
            }
        });
    }

    info!("{} ({}) disconnected from gateway", name, user_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    name: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Typing { to, conversation } => {
            let target = match (to, conversation) {
                (Some(to), None) => TypingTarget::User(to),
                (None, Some(conversation)) => TypingTarget::Conversation(conversation),
                _ => {
                    warn!("{} ({}) typing command needs exactly one target", name, user_id);
                    return;
                }
            };

            let db = db.clone();
            let dispatcher = dispatcher.clone();
            let name = name.to_string();
            let result = tokio::task::spawn_blocking(move || {
                typing::notify_typing(&db, &dispatcher, user_id, target)
            })
            .await;

            match result {
                Ok(Ok(TypingOutcome::Sent)) => {}
                Ok(Ok(TypingOutcome::Rejected(errors))) => {
                    warn!("{} ({}) typing rejected: {:?}", name, user_id, errors);
                }
                Ok(Err(e)) => warn!("{} ({}) typing failed: {}", name, user_id, e),
                Err(e) => warn!("spawn_blocking join error: {}", e),
            }
        }
    }
}
