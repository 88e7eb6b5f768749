use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Instant;

use codeduel_core::protocol::ServerMessage;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::Config;
use crate::notify::Notifier;
use crate::provider::{CodeRunner, ProblemProvider};

/// Handle to push messages to a connected WebSocket client.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub player_id: i64,
    pub handle: String,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
    /// Running global matchmaking search, if any.
    pub search: Option<AbortHandle>,
    /// Running clan matchmaking search, if any.
    pub clan_search: Option<(String, AbortHandle)>,
    /// Messages received in the current second window.
    pub message_count: u32,
    pub rate_limit_window: Instant,
}

/// Shared application state.
pub struct AppState {
    pub db: SqlitePool,
    pub notifier: Notifier,
    pub problems: Arc<dyn ProblemProvider>,
    pub runner: Arc<dyn CodeRunner>,
    pub config: Config,
    pub connections: DashMap<i64, ConnectionHandle>,
    pub connection_count: AtomicU32,
}

/// Push a message to a player if they are connected.
pub fn send_to(state: &AppState, player_id: i64, msg: ServerMessage) {
    if let Some(conn) = state.connections.get(&player_id) {
        let _ = conn.tx.send(msg);
    }
}
