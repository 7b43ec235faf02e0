use std::str::FromStr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::Subscription;
use crate::db;
use crate::models::{inbound, ClientFrame, ServerFrame, SessionStatus};
use crate::session::SessionId;
use crate::AppState;

/// `GET /api/research/ws/:session_id` — upgrades to a duplex connection
/// for an already-registered session (see `orchestrator::start_session`).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id_raw): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id_raw))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id_raw: String) {
    let session_id = match SessionId::from_str(&session_id_raw) {
        Ok(id) => id,
        Err(_) => {
            let (mut sender, _) = socket.split();
            let frame = ServerFrame::error(&session_id_raw, "malformed session id");
            let _ = send_frame(&mut sender, &frame).await;
            return;
        }
    };

    let (user_id, tier) = match state.session_manager.session_owner(session_id).await {
        Ok(owner) => owner,
        Err(e) => {
            let (mut sender, _) = socket.split();
            let frame = ServerFrame::error(&session_id_raw, e.user_message());
            let _ = send_frame(&mut sender, &frame).await;
            return;
        }
    };

    let topic = format!("credit_update_{user_id}");
    let subscription = state.broker.subscribe(&topic).await;

    let (sender, receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));
    let cancel = CancellationToken::new();

    let read_task = tokio::spawn(read_loop(
        receiver,
        sender.clone(),
        state.clone(),
        session_id,
        cancel.clone(),
    ));
    let write_task = tokio::spawn(write_tick_loop(
        sender,
        state.clone(),
        session_id,
        user_id.clone(),
        tier,
        subscription,
        cancel.clone(),
    ));

    let _ = tokio::join!(read_task, write_task);
}

type WsSender = Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>;

async fn send_frame(sender: &mut futures::stream::SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(t) => t,
        Err(_) => return false,
    };
    sender.send(Message::Text(text)).await.is_ok()
}

async fn send_frame_locked(sender: &WsSender, frame: &ServerFrame) -> bool {
    let mut guard = sender.lock().await;
    send_frame(&mut guard, frame).await
}

/// Reads inbound frames and dispatches them; ends the connection's life
/// (via `cancel`) on socket close, error, or an explicit `terminate`.
async fn read_loop(
    mut receiver: futures::stream::SplitStream<WebSocket>,
    sender: WsSender,
    state: AppState,
    session_id: SessionId,
    cancel: CancellationToken,
) {
    let session_id_str = session_id.to_string();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = receiver.next() => msg,
        };

        let Some(msg) = msg else {
            cancel.cancel();
            break;
        };

        let msg = match msg {
            Ok(m) => m,
            Err(_) => {
                cancel.cancel();
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                cancel.cancel();
                break;
            }
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(session_id = %session_id_str, error = %e, "malformed inbound frame, ignoring");
                continue;
            }
        };

        match frame.frame_type.as_str() {
            inbound::MESSAGE => {
                handle_message_turn(&state, session_id, &session_id_str, &frame.content, &sender, &cancel).await;
            }
            inbound::TERMINATE => {
                match state
                    .session_manager
                    .terminate(session_id, crate::models::TerminationReason::UserInitiated)
                    .await
                {
                    Ok(()) => {
                        send_frame_locked(&sender, &ServerFrame::info(&session_id_str, "terminated")).await;
                    }
                    Err(e) => {
                        send_frame_locked(&sender, &ServerFrame::error(&session_id_str, e.user_message())).await;
                    }
                }
                cancel.cancel();
                break;
            }
            inbound::GET_SESSION_STATUS => match state.session_manager.check_status(session_id).await {
                Ok(status) => {
                    send_frame_locked(&sender, &ServerFrame::session_status(&session_id_str, status)).await;
                }
                Err(e) => {
                    send_frame_locked(&sender, &ServerFrame::error(&session_id_str, e.user_message())).await;
                }
            },
            inbound::EXTEND_SESSION => match state.session_manager.extend_session(session_id).await {
                Ok(()) => {
                    send_frame_locked(&sender, &ServerFrame::info(&session_id_str, "extended")).await;
                }
                Err(e) => {
                    send_frame_locked(&sender, &ServerFrame::error(&session_id_str, e.user_message())).await;
                }
            },
            other => {
                tracing::warn!(session_id = %session_id_str, frame_type = other, "unknown inbound frame type, ignoring");
            }
        }
    }
}

/// `type=message`: stream the turn, forwarding tokens in order before any
/// other frame for this connection is sent, per the ordering guarantee.
/// Races every event against `cancel` so a dropped connection aborts the
/// in-flight turn instead of running it to completion (§5).
async fn handle_message_turn(
    state: &AppState,
    session_id: SessionId,
    session_id_str: &str,
    text: &str,
    sender: &WsSender,
    cancel: &CancellationToken,
) {
    if let Err(e) = db::save_message(&state.db, session_id_str, "user", text).await {
        tracing::warn!(session_id = session_id_str, error = %e, "failed to persist user turn");
    }

    let mut stream = match state
        .session_manager
        .stream_message(session_id, text, cancel.child_token())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            send_frame_locked(sender, &ServerFrame::error(session_id_str, e.user_message())).await;
            return;
        }
    };

    let mut aggregated = String::new();
    let mut cancelled = false;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            crate::llm::StreamEvent::Content { content } => {
                aggregated.push_str(&content);
                send_frame_locked(sender, &ServerFrame::ai(session_id_str, content)).await;
            }
            crate::llm::StreamEvent::Done { .. } => break,
            crate::llm::StreamEvent::Error { message } => {
                send_frame_locked(sender, &ServerFrame::error(session_id_str, message)).await;
                break;
            }
        }
    }

    if cancelled {
        let err = crate::error::AppError::UpstreamTimeout("stream_message".to_string());
        tracing::warn!(session_id = session_id_str, error = %err, "turn aborted by connection cancellation");
        return;
    }

    if let Err(e) = db::save_message(&state.db, session_id_str, "ai", &aggregated).await {
        tracing::warn!(session_id = session_id_str, error = %e, "failed to persist ai turn");
    }
    send_frame_locked(sender, &ServerFrame::ai(session_id_str, "[END]")).await;

    if let Err(e) = state.session_manager.update_activity(session_id).await {
        tracing::warn!(session_id = session_id_str, error = %e, "post-turn update_activity failed");
    }
}

/// Separate task: periodic status/credit frames plus forwarding of
/// broker-published credit updates for this user.
async fn write_tick_loop(
    sender: WsSender,
    state: AppState,
    session_id: SessionId,
    user_id: String,
    tier: crate::models::Tier,
    mut subscription: Subscription,
    cancel: CancellationToken,
) {
    let session_id_str = session_id.to_string();
    let mut ticker = tokio::time::interval(state.config.session_check_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let status = match state.session_manager.check_status(session_id).await {
                    Ok(s) => s,
                    Err(_) => { cancel.cancel(); break; }
                };

                match status {
                    SessionStatus::Warning => {
                        if let Ok(budget) = state.cache_manager.read_budget(&user_id, tier).await {
                            send_frame_locked(&sender, &ServerFrame::credit_warning(&session_id_str, budget.remaining())).await;
                        }
                    }
                    SessionStatus::Expired => {
                        send_frame_locked(&sender, &ServerFrame::expired(&session_id_str)).await;
                        cancel.cancel();
                        break;
                    }
                    SessionStatus::Active => {}
                }

                if let Ok(budget) = state.cache_manager.read_budget(&user_id, tier).await {
                    if budget.is_low(state.config.low_credit_threshold) {
                        send_frame_locked(&sender, &ServerFrame::credit_warning(&session_id_str, budget.remaining())).await;
                    }
                }

                send_frame_locked(&sender, &ServerFrame::session_status(&session_id_str, status)).await;
            }
            msg = subscription.rx.recv() => {
                match msg {
                    Some(payload) => {
                        send_frame_locked(&sender, &ServerFrame::credit_update(&session_id_str, payload)).await;
                    }
                    None => break,
                }
            }
        }
    }

    state.broker.unsubscribe(&subscription.topic, subscription.id).await;
}
