//! Agent WebSocket channel
//!
//! Each remote browser agent holds one bidirectional channel per sender
//! session. The first event must be `auth`; it binds the socket to a sender,
//! registers the channel in the registry, and marks the sender online. After
//! that the agent renews its heartbeat, pulls tasks, and reports results
//! over the same socket, while the server pushes new tasks, ETA hints, and
//! account-wide notifications through the registry channel.
//!
//! Messages are JSON-tagged events; a frame that does not parse into a known
//! event kind is rejected at the boundary and logged, never passed through.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use shared::api::{AgentEvent, ServerEvent};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::scheduler::task_payload;
use crate::reconcile;

/// Upgrade handler for `GET /api/v1/agent/ws`.
pub async fn handle_agent_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| agent_socket(socket, state))
}

fn api_key_matches(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    provided.len() == expected.len() && bool::from(provided.ct_eq(expected))
}

/// Drives one agent connection until it closes.
async fn agent_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Outbound pump: registry events and direct replies share one channel
    // so ordering toward the agent is preserved.
    let pump = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server event");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // (sender_id, account_id) once the channel has authenticated.
    let mut session: Option<(String, String)> = None;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Agent socket error");
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by the framework; binary frames are not
            // part of the protocol.
            _ => continue,
        };

        let event: AgentEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Rejected unknown agent event");
                continue;
            }
        };

        match event {
            AgentEvent::Auth {
                api_key,
                account_id,
                sender_id,
                outbound_account_id,
            } => {
                if !api_key_matches(&api_key, &state.config.api_key) {
                    warn!(sender_id = %sender_id, "Agent auth failed: bad API key");
                    let _ = tx.send(ServerEvent::AuthError {
                        message: "Invalid credentials".to_string(),
                    });
                    break;
                }

                let now = shared::current_timestamp();
                let registered = {
                    let mut store = state.store.lock().await;
                    store
                        .register_sender_session(
                            &sender_id,
                            &account_id,
                            outbound_account_id.as_deref(),
                            now,
                        )
                        .await
                };
                match registered {
                    Ok(sender) => {
                        state
                            .registry
                            .register(&sender.id, &account_id, tx.clone())
                            .await;
                        info!(
                            sender_id = %sender.id,
                            account_id = %account_id,
                            "Agent channel authenticated"
                        );
                        let _ = tx.send(ServerEvent::AuthOk {
                            account_id: account_id.clone(),
                            sender_id: sender.id.clone(),
                        });
                        state
                            .registry
                            .push_to_account(
                                &account_id,
                                ServerEvent::SenderOnline {
                                    sender_id: sender.id.clone(),
                                },
                            )
                            .await;
                        session = Some((sender.id, account_id));
                    }
                    Err(e) => {
                        warn!(sender_id = %sender_id, error = %e, "Agent auth failed");
                        let _ = tx.send(ServerEvent::AuthError {
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }

            other => {
                let Some((sender_id, account_id)) = session.as_ref() else {
                    let _ = tx.send(ServerEvent::AuthError {
                        message: "Not authenticated".to_string(),
                    });
                    break;
                };
                handle_agent_event(&state, &tx, sender_id, account_id, other).await;
            }
        }
    }

    // Tear down: the registry entry goes away and the store view follows.
    if let Some((sender_id, account_id)) = session {
        state.registry.forget(&sender_id).await;
        {
            let mut store = state.store.lock().await;
            if let Err(e) = store.set_sender_offline(&sender_id).await {
                warn!(sender_id = %sender_id, error = %e, "Failed to mark sender offline");
            }
        }
        state
            .registry
            .push_to_account(
                &account_id,
                ServerEvent::SenderOffline {
                    sender_id: sender_id.clone(),
                },
            )
            .await;
        info!(sender_id = %sender_id, "Agent channel closed");
    }

    drop(tx);
    pump.abort();
}

/// Handles one authenticated agent event.
async fn handle_agent_event(
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    sender_id: &str,
    account_id: &str,
    event: AgentEvent,
) {
    let now = shared::current_timestamp();
    match event {
        AgentEvent::Auth { .. } => unreachable!("auth handled by the connection loop"),

        AgentEvent::Heartbeat => {
            let mut store = state.store.lock().await;
            if let Err(e) = store.sender_heartbeat(sender_id, now).await {
                warn!(sender_id = %sender_id, error = %e, "Failed to renew heartbeat");
            }
        }

        AgentEvent::TaskPickup { sender_scoped } => {
            let scope = sender_scoped.then_some(sender_id);
            let picked = {
                let mut store = state.store.lock().await;
                store.pickup_task(account_id, scope, now).await
            };
            match picked {
                Ok(task) => {
                    if let Some(task) = &task {
                        info!(
                            sender_id = %sender_id,
                            task_id = %task.id,
                            attempts = task.attempts,
                            "Task picked up over channel"
                        );
                    }
                    let _ = tx.send(ServerEvent::TaskPickupResult {
                        task: task.as_ref().map(task_payload),
                    });
                }
                Err(e) => {
                    warn!(sender_id = %sender_id, error = %e, "Task pickup failed");
                    let _ = tx.send(ServerEvent::TaskPickupResult { task: None });
                }
            }
        }

        AgentEvent::TaskComplete { task_id, result } => {
            if let Err(e) =
                reconcile::handle_completion(&state.store, &state.registry, &task_id, &result, now)
                    .await
            {
                warn!(task_id = %task_id, error = %e, "Completion report rejected");
            }
        }

        AgentEvent::TaskFail { task_id, error } => {
            if let Err(e) = reconcile::handle_failure(
                &state.store,
                &state.registry,
                &state.config,
                &task_id,
                &error,
                now,
            )
            .await
            {
                warn!(task_id = %task_id, error = %e, "Failure report rejected");
            }
        }
    }
}
