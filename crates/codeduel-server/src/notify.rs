//! Row-change notifications.
//!
//! Every write to a shared row publishes a `RowChange` after it lands. Nothing
//! depends on delivery: a lagging subscriber just misses events and its poll
//! loop picks up the state on the next tick.

use codeduel_core::{BattleStatus, QueueStatus};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Queue {
        player_id: i64,
        status: Option<QueueStatus>,
        battle_id: Option<String>,
    },
    /// A claimed pair was released because creating its battle failed.
    MatchAborted {
        player_id: i64,
        reason: String,
    },
    ClanQueue {
        clan_id: String,
        status: Option<QueueStatus>,
    },
    Battle {
        battle_id: String,
        status: BattleStatus,
    },
    ClanBattle {
        battle_id: String,
        clan_ids: (String, String),
        status: BattleStatus,
    },
}

impl RowChange {
    /// Whether this change concerns `clan_id`'s queue row or one of its battles.
    pub fn touches_clan(&self, clan_id: &str) -> bool {
        match self {
            RowChange::ClanQueue { clan_id: c, .. } => c == clan_id,
            RowChange::ClanBattle { clan_ids, .. } => clan_ids.0 == clan_id || clan_ids.1 == clan_id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<RowChange>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, change: RowChange) {
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.tx.subscribe()
    }
}
