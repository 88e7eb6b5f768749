use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;

use codeduel_core::protocol::{ClientMessage, ServerMessage};

use crate::battle::{self, Completion};
use crate::clan_matchmaking;
use crate::db::{self, PlayerRow, now_millis};
use crate::error::{ArenaError, TimeoutKind};
use crate::matchmaking;
use crate::state::*;
use crate::verdict;

const RATE_LIMIT_PER_SECOND: u32 = 20;

/// Top-level WebSocket handler, spawned per connection.
pub async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket, player: PlayerRow) {
    state.connection_count.fetch_add(1, Ordering::Relaxed);
    let player_id = player.id;

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    state.connections.insert(
        player_id,
        ConnectionHandle {
            player_id,
            handle: player.handle.clone(),
            tx: tx.clone(),
            search: None,
            clan_search: None,
            message_count: 0,
            rate_limit_window: Instant::now(),
        },
    );
    tracing::info!(player_id, handle = %player.handle, "player connected");

    let _ = tx.send(ServerMessage::Hello {
        handle: player.handle,
        rating: player.rating,
        xp: player.xp,
    });

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut conn = match state.connections.get_mut(&player_id) {
                                Some(c) => c,
                                None => break,
                            };
                            let now = Instant::now();
                            if now.duration_since(conn.rate_limit_window) > Duration::from_secs(1) {
                                conn.rate_limit_window = now;
                                conn.message_count = 0;
                            }
                            conn.message_count += 1;
                            if conn.message_count > RATE_LIMIT_PER_SECOND {
                                let _ = conn.tx.send(ServerMessage::Error {
                                    message: "Rate limited".into(),
                                });
                                continue;
                            }
                        }

                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                let _ = tx.send(ServerMessage::Error {
                                    message: format!("Invalid message: {e}"),
                                });
                                continue;
                            }
                        };

                        handle_message(&state, player_id, &tx, client_msg).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => continue,
                }
            }
        }
    }

    // Disconnected: stop searching and drop queue rows.
    if let Some((_, conn)) = state.connections.remove(&player_id) {
        if let Some(search) = conn.search {
            search.abort();
        }
        if let Some((clan_id, search)) = conn.clan_search {
            search.abort();
            if let Err(e) = clan_matchmaking::leave_clan_queue(&state, &clan_id).await {
                tracing::warn!(player_id, error = %e, "could not leave clan queue");
            }
        }
    }
    if let Err(e) = matchmaking::release_stale_claims(&state, player_id).await {
        tracing::warn!(player_id, error = %e, "could not release claimed pair");
    }
    if let Err(e) = matchmaking::leave_queue(&state, player_id).await {
        tracing::warn!(player_id, error = %e, "could not leave queue");
    }
    state.connection_count.fetch_sub(1, Ordering::Relaxed);
    tracing::info!(player_id, "player disconnected");
}

/// Dispatch a single client message.
async fn handle_message(
    state: &Arc<AppState>,
    player_id: i64,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::JoinQueue => {
            abort_search(state, player_id);
            if let Err(e) = matchmaking::join_queue(state, player_id).await {
                send_error(tx, &e);
                return;
            }
            let _ = tx.send(ServerMessage::Searching);

            let task_state = state.clone();
            let task = tokio::spawn(async move {
                let msg = match matchmaking::await_match(&task_state, player_id).await {
                    Ok(battle) => ServerMessage::MatchFound {
                        battle: battle::view(&battle, now_millis()),
                    },
                    Err(ArenaError::Timeout(_)) => ServerMessage::NoOpponentFound,
                    Err(
                        e @ (ArenaError::NoProblemsInRange { .. }
                        | ArenaError::ExternalProvider(_)
                        | ArenaError::PartialWriteFailure(_)
                        | ArenaError::MatchAborted(_)),
                    ) => ServerMessage::MatchFailed {
                        reason: e.to_string(),
                    },
                    Err(e) => ServerMessage::Error {
                        message: e.to_string(),
                    },
                };
                send_to(&task_state, player_id, msg);
            });
            if let Some(mut conn) = state.connections.get_mut(&player_id) {
                conn.search = Some(task.abort_handle());
            }
        }

        ClientMessage::LeaveQueue => {
            abort_search(state, player_id);
            if let Err(e) = matchmaking::leave_queue(state, player_id).await {
                send_error(tx, &e);
            }
        }

        ClientMessage::JoinClanQueue { members } => {
            let clan_id = match db::get_player(&state.db, player_id).await {
                Ok(Some(PlayerRow { clan_id: Some(clan_id), .. })) => clan_id,
                Ok(_) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: "You are not in a clan".into(),
                    });
                    return;
                }
                Err(e) => {
                    send_error(tx, &ArenaError::from(e));
                    return;
                }
            };
            abort_clan_search(state, player_id);
            if let Err(e) = clan_matchmaking::join_clan_queue(state, &clan_id, &members).await {
                send_error(tx, &e);
                return;
            }
            let _ = tx.send(ServerMessage::Searching);

            let mut recipients = members;
            if !recipients.contains(&player_id) {
                recipients.push(player_id);
            }
            let task_state = state.clone();
            let task_clan = clan_id.clone();
            let task = tokio::spawn(async move {
                let msg = match clan_matchmaking::await_clan_match(&task_state, &task_clan).await {
                    Ok(battle) => {
                        let opponent_clan_id = if battle.clan1_id == task_clan {
                            battle.clan2_id.clone()
                        } else {
                            battle.clan1_id.clone()
                        };
                        ServerMessage::ClanMatchFound {
                            battle_id: battle.id,
                            opponent_clan_id,
                        }
                    }
                    Err(ArenaError::Timeout(TimeoutKind::ClanBattleWait)) => {
                        ServerMessage::ClanMatchFailed {
                            reason: "The opponent clan did not set up the battle in time".into(),
                        }
                    }
                    Err(ArenaError::Timeout(_)) => ServerMessage::ClanMatchFailed {
                        reason: "No opponent clan found".into(),
                    },
                    Err(e) => ServerMessage::ClanMatchFailed {
                        reason: e.to_string(),
                    },
                };
                for member in recipients {
                    send_to(&task_state, member, msg.clone());
                }
            });
            if let Some(mut conn) = state.connections.get_mut(&player_id) {
                conn.clan_search = Some((clan_id, task.abort_handle()));
            }
        }

        ClientMessage::LeaveClanQueue => {
            if let Some(clan_id) = abort_clan_search(state, player_id) {
                if let Err(e) = clan_matchmaking::leave_clan_queue(state, &clan_id).await {
                    send_error(tx, &e);
                }
            }
        }

        ClientMessage::Quit { battle_id } => {
            match battle::quit_battle(state, &battle_id, player_id).await {
                Ok(completion) => announce_end(state, &completion).await,
                Err(e) => send_error(tx, &e),
            }
        }

        ClientMessage::CheckVerdict {
            battle_id,
            submitted_at,
        } => {
            let state = state.clone();
            tokio::spawn(async move {
                match verdict::check_battle_verdict(&state, &battle_id, player_id, submitted_at)
                    .await
                {
                    Ok(outcome) => {
                        send_to(
                            &state,
                            player_id,
                            ServerMessage::Verdict {
                                battle_id,
                                verdict: outcome.verdict,
                                xp: outcome.xp,
                            },
                        );
                        if let Some(completion) = outcome.completion {
                            announce_end(&state, &completion).await;
                        }
                    }
                    Err(e) => verdict_failed(&state, player_id, battle_id, e),
                }
            });
        }

        ClientMessage::CheckClanVerdict {
            battle_id,
            position,
            submitted_at,
        } => {
            let state = state.clone();
            tokio::spawn(async move {
                match verdict::check_clan_verdict(
                    &state,
                    &battle_id,
                    player_id,
                    position,
                    submitted_at,
                )
                .await
                {
                    Ok(outcome) => send_to(
                        &state,
                        player_id,
                        ServerMessage::Verdict {
                            battle_id,
                            verdict: outcome.verdict,
                            xp: outcome.xp,
                        },
                    ),
                    Err(e) => verdict_failed(&state, player_id, battle_id, e),
                }
            });
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<ServerMessage>, e: &ArenaError) {
    let _ = tx.send(ServerMessage::Error {
        message: e.to_string(),
    });
}

fn verdict_failed(state: &AppState, player_id: i64, battle_id: String, e: ArenaError) {
    let msg = match e {
        ArenaError::Timeout(_) => ServerMessage::VerdictUnavailable {
            battle_id,
            message: "The judge has not returned a verdict yet. Check your submission on the judge site."
                .into(),
        },
        e => ServerMessage::Error {
            message: e.to_string(),
        },
    };
    send_to(state, player_id, msg);
}

fn abort_search(state: &AppState, player_id: i64) {
    if let Some(mut conn) = state.connections.get_mut(&player_id) {
        if let Some(search) = conn.search.take() {
            search.abort();
        }
    }
}

/// Abort a running clan search. Returns the clan it was for.
fn abort_clan_search(state: &AppState, player_id: i64) -> Option<String> {
    let mut conn = state.connections.get_mut(&player_id)?;
    let (clan_id, search) = conn.clan_search.take()?;
    search.abort();
    Some(clan_id)
}

/// Tell both players how a battle ended and what it did to their standing.
async fn announce_end(state: &AppState, completion: &Completion) {
    let b = &completion.battle;
    for player_id in [b.player1_id, b.player2_id] {
        let change = completion.changes.as_ref().and_then(|c| {
            [&c.winner, &c.loser]
                .into_iter()
                .find(|p| p.player_id == player_id)
                .cloned()
        });
        let (rating_change, new_rating, xp_change) = match change {
            Some(p) => (p.rating_change(), p.rating_after, p.xp_delta),
            None => match db::get_player(&state.db, player_id).await {
                Ok(Some(p)) => (0, p.rating, 0.0),
                _ => continue,
            },
        };
        send_to(
            state,
            player_id,
            ServerMessage::BattleEnded {
                battle_id: b.id.clone(),
                status: b.status,
                winner_id: completion.winner_id,
                rating_change,
                new_rating,
                xp_change,
            },
        );
    }
}
