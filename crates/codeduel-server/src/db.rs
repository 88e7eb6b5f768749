//! SQLite schema and queries.
//!
//! Every multi-writer transition is a conditional update returning the number
//! of rows it touched; callers treat a short count as a lost race.

use std::str::FromStr;

use codeduel_core::battle::UnknownStatus;
use codeduel_core::clan::ClanProblem;
use codeduel_core::protocol::BattleProblem;
use codeduel_core::{BattleKind, BattleStatus, ProblemKey, QueueStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqliteExecutor, SqlitePool};

/// Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open the pool. In-memory databases live on a single connection that is never recycled.
pub async fn connect(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(db_url)?.foreign_keys(true);
    let pool = if db_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };
    init_db(&pool).await?;
    Ok(pool)
}

/// Create all tables if they don't exist.
pub async fn init_db(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS clans (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            leader_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS players (
            id INTEGER PRIMARY KEY,
            handle TEXT UNIQUE NOT NULL,
            rating INTEGER NOT NULL DEFAULT 1200,
            xp REAL NOT NULL DEFAULT 0 CHECK (xp >= 0),
            clan_id TEXT REFERENCES clans(id),
            wins INTEGER NOT NULL DEFAULT 0,
            losses INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS matchmaking_queue (
            player_id INTEGER PRIMARY KEY REFERENCES players(id),
            rating INTEGER NOT NULL,
            status TEXT NOT NULL,
            matched_with_id INTEGER,
            battle_id TEXT,
            claimed_by INTEGER,
            joined_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS clan_matchmaking_queue (
            clan_id TEXT PRIMARY KEY REFERENCES clans(id),
            strength INTEGER NOT NULL,
            selected_members TEXT NOT NULL,
            status TEXT NOT NULL,
            matched_with_clan_id TEXT,
            battle_id TEXT,
            queue_time INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS battles (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            player1_id INTEGER NOT NULL REFERENCES players(id),
            player2_id INTEGER NOT NULL REFERENCES players(id),
            status TEXT NOT NULL,
            contest_id INTEGER,
            problem_index TEXT,
            problem_name TEXT,
            problem_rating INTEGER,
            problem_tags TEXT,
            start_time INTEGER,
            duration_seconds INTEGER NOT NULL,
            winner_id INTEGER,
            created_at INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS battles_open_pair
            ON battles (min(player1_id, player2_id), max(player1_id, player2_id))
            WHERE status IN ('waiting', 'request_sent', 'preparing', 'active', 'in_progress')",
        "CREATE TABLE IF NOT EXISTS battle_participants (
            battle_id TEXT NOT NULL REFERENCES battles(id) ON DELETE CASCADE,
            player_id INTEGER NOT NULL REFERENCES players(id),
            problem_solved INTEGER NOT NULL DEFAULT 0,
            time_taken INTEGER,
            rating_change INTEGER,
            xp_change REAL,
            PRIMARY KEY (battle_id, player_id)
        )",
        "CREATE TABLE IF NOT EXISTS clan_battles (
            id TEXT PRIMARY KEY,
            clan1_id TEXT NOT NULL REFERENCES clans(id),
            clan2_id TEXT NOT NULL REFERENCES clans(id),
            status TEXT NOT NULL,
            start_time INTEGER,
            duration_seconds INTEGER NOT NULL,
            winner_clan_id TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS clan_battles_open_pair
            ON clan_battles (min(clan1_id, clan2_id), max(clan1_id, clan2_id))
            WHERE status IN ('preparing', 'in_progress')",
        "CREATE TABLE IF NOT EXISTS clan_battle_participants (
            battle_id TEXT NOT NULL REFERENCES clan_battles(id) ON DELETE CASCADE,
            player_id INTEGER NOT NULL REFERENCES players(id),
            clan_id TEXT NOT NULL,
            problems_solved INTEGER NOT NULL DEFAULT 0,
            time_taken INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (battle_id, player_id)
        )",
        "CREATE TABLE IF NOT EXISTS clan_battle_problems (
            battle_id TEXT NOT NULL REFERENCES clan_battles(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            contest_id INTEGER NOT NULL,
            problem_index TEXT NOT NULL,
            name TEXT NOT NULL,
            rating INTEGER NOT NULL,
            points INTEGER NOT NULL,
            PRIMARY KEY (battle_id, position)
        )",
        "CREATE TABLE IF NOT EXISTS clan_battle_solves (
            battle_id TEXT NOT NULL REFERENCES clan_battles(id) ON DELETE CASCADE,
            clan_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            player_id INTEGER NOT NULL,
            solved_at INTEGER NOT NULL,
            PRIMARY KEY (battle_id, clan_id, position)
        )",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

fn parse<T: FromStr<Err = UnknownStatus>>(raw: String) -> Result<T, sqlx::Error> {
    raw.parse().map_err(|e: UnknownStatus| sqlx::Error::Decode(Box::new(e)))
}

fn open_statuses_sql() -> String {
    BattleStatus::open()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Players ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PlayerRow {
    pub id: i64,
    pub handle: String,
    pub rating: i32,
    pub xp: f64,
    pub clan_id: Option<String>,
    pub wins: i32,
    pub losses: i32,
}

const PLAYER_COLUMNS: &str = "id, handle, rating, xp, clan_id, wins, losses";

fn player_from_row(r: &SqliteRow) -> PlayerRow {
    PlayerRow {
        id: r.get("id"),
        handle: r.get("handle"),
        rating: r.get("rating"),
        xp: r.get("xp"),
        clan_id: r.get("clan_id"),
        wins: r.get("wins"),
        losses: r.get("losses"),
    }
}

/// Insert a player if the handle is new. Returns the player id.
pub async fn upsert_player(pool: &SqlitePool, handle: &str) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "INSERT INTO players (handle, created_at) VALUES (?1, ?2)
         ON CONFLICT(handle) DO NOTHING",
    )
    .bind(handle)
    .bind(now_millis())
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id FROM players WHERE handle = ?1")
        .bind(handle)
        .fetch_one(pool)
        .await?;

    Ok(row.get::<i64, _>("id"))
}

pub async fn get_player(
    ex: impl SqliteExecutor<'_>,
    id: i64,
) -> Result<Option<PlayerRow>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = ?1"))
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row.as_ref().map(player_from_row))
}

pub async fn get_player_by_handle(
    ex: impl SqliteExecutor<'_>,
    handle: &str,
) -> Result<Option<PlayerRow>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {PLAYER_COLUMNS} FROM players WHERE handle = ?1"))
        .bind(handle)
        .fetch_optional(ex)
        .await?;
    Ok(row.as_ref().map(player_from_row))
}

/// Set a rating and bump the win or loss counter.
pub async fn set_rating(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
    rating: i32,
    won: bool,
) -> Result<(), sqlx::Error> {
    let sql = if won {
        "UPDATE players SET rating = ?1, wins = wins + 1 WHERE id = ?2"
    } else {
        "UPDATE players SET rating = ?1, losses = losses + 1 WHERE id = ?2"
    };
    sqlx::query(sql).bind(rating).bind(player_id).execute(ex).await?;
    Ok(())
}

/// Add `delta` to a player's XP in place, clamped at zero. Returns the new XP.
pub async fn add_xp(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
    delta: f64,
) -> Result<Option<f64>, sqlx::Error> {
    let row = sqlx::query("UPDATE players SET xp = max(0.0, xp + ?1) WHERE id = ?2 RETURNING xp")
        .bind(delta)
        .bind(player_id)
        .fetch_optional(ex)
        .await?;
    Ok(row.map(|r| r.get::<f64, _>("xp")))
}

/// Get top players by rating.
pub async fn get_leaderboard(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<PlayerRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {PLAYER_COLUMNS} FROM players ORDER BY rating DESC, xp DESC LIMIT ?1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(player_from_row).collect())
}

// ── Clans ───────────────────────────────────────────────────────────────

pub async fn create_clan(
    pool: &SqlitePool,
    name: &str,
    leader_id: i64,
) -> Result<String, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO clans (id, name, leader_id, created_at) VALUES (?1, ?2, ?3, ?4)")
        .bind(&id)
        .bind(name)
        .bind(leader_id)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;
    set_player_clan(&mut *tx, leader_id, Some(&id)).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn clan_exists(ex: impl SqliteExecutor<'_>, clan_id: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM clans WHERE id = ?1")
        .bind(clan_id)
        .fetch_optional(ex)
        .await?;
    Ok(row.is_some())
}

pub async fn set_player_clan(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
    clan_id: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query("UPDATE players SET clan_id = ?1 WHERE id = ?2")
        .bind(clan_id)
        .bind(player_id)
        .execute(ex)
        .await?;
    Ok(done.rows_affected())
}

pub async fn clan_members(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
) -> Result<Vec<PlayerRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {PLAYER_COLUMNS} FROM players WHERE clan_id = ?1 ORDER BY id"
    ))
    .bind(clan_id)
    .fetch_all(ex)
    .await?;
    Ok(rows.iter().map(player_from_row).collect())
}

// ── Global matchmaking queue ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub player_id: i64,
    pub rating: i32,
    pub status: QueueStatus,
    pub matched_with_id: Option<i64>,
    pub battle_id: Option<String>,
    pub joined_at: i64,
}

fn queue_from_row(r: &SqliteRow) -> Result<QueueRow, sqlx::Error> {
    Ok(QueueRow {
        player_id: r.get("player_id"),
        rating: r.get("rating"),
        status: parse(r.get("status"))?,
        matched_with_id: r.get("matched_with_id"),
        battle_id: r.get("battle_id"),
        joined_at: r.get("joined_at"),
    })
}

pub async fn delete_queue_entry(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query("DELETE FROM matchmaking_queue WHERE player_id = ?1")
        .bind(player_id)
        .execute(ex)
        .await?;
    Ok(done.rows_affected())
}

/// Remove the entry only while it is still searching.
pub async fn delete_searching_entry(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "DELETE FROM matchmaking_queue WHERE player_id = ?1 AND status = 'searching'",
    )
    .bind(player_id)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn insert_queue_entry(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
    rating: i32,
) -> Result<(), sqlx::Error> {
    let now = now_millis();
    sqlx::query(
        "INSERT INTO matchmaking_queue (player_id, rating, status, joined_at, updated_at)
         VALUES (?1, ?2, 'searching', ?3, ?3)",
    )
    .bind(player_id)
    .bind(rating)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_queue_entry(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
) -> Result<Option<QueueRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM matchmaking_queue WHERE player_id = ?1")
        .bind(player_id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(queue_from_row).transpose()
}

/// All searching entries except `exclude`, oldest first.
pub async fn searching_entries(
    ex: impl SqliteExecutor<'_>,
    exclude: i64,
) -> Result<Vec<QueueRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM matchmaking_queue
         WHERE status = 'searching' AND player_id != ?1
         ORDER BY joined_at ASC",
    )
    .bind(exclude)
    .fetch_all(ex)
    .await?;
    rows.iter().map(queue_from_row).collect()
}

/// `searching -> creating` for both players. Returns rows claimed.
pub async fn claim_pair(
    ex: impl SqliteExecutor<'_>,
    a: i64,
    b: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE matchmaking_queue SET status = 'creating', claimed_by = ?1, updated_at = ?3
         WHERE player_id IN (?1, ?2) AND status = 'searching'",
    )
    .bind(a)
    .bind(b)
    .bind(now_millis())
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

/// `creating -> searching` for both players after a failed creation.
pub async fn release_pair(
    ex: impl SqliteExecutor<'_>,
    a: i64,
    b: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE matchmaking_queue SET status = 'searching', claimed_by = NULL, updated_at = ?3
         WHERE player_id IN (?1, ?2) AND status = 'creating'",
    )
    .bind(a)
    .bind(b)
    .bind(now_millis())
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

/// `creating -> searching` for every row claimed by `claimant`. Returns the released players.
pub async fn release_claims_by(
    ex: impl SqliteExecutor<'_>,
    claimant: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE matchmaking_queue SET status = 'searching', claimed_by = NULL, updated_at = ?2
         WHERE claimed_by = ?1 AND status = 'creating'
         RETURNING player_id",
    )
    .bind(claimant)
    .bind(now_millis())
    .fetch_all(ex)
    .await?;
    Ok(rows.iter().map(|r| r.get("player_id")).collect())
}

/// `creating -> matched`, cross-referencing the two players and the battle.
pub async fn mark_pair_matched(
    ex: impl SqliteExecutor<'_>,
    a: i64,
    b: i64,
    battle_id: &str,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE matchmaking_queue
         SET status = 'matched',
             matched_with_id = CASE player_id WHEN ?1 THEN ?2 ELSE ?1 END,
             battle_id = ?3,
             updated_at = ?4
         WHERE player_id IN (?1, ?2) AND status = 'creating'",
    )
    .bind(a)
    .bind(b)
    .bind(battle_id)
    .bind(now_millis())
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

/// Drop searching rows older than `searching_before` and matched rows older than `matched_before`.
pub async fn sweep_queue(
    ex: impl SqliteExecutor<'_>,
    searching_before: i64,
    matched_before: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query(
        "DELETE FROM matchmaking_queue
         WHERE (status = 'searching' AND joined_at < ?1)
            OR (status != 'searching' AND updated_at < ?2)
         RETURNING player_id",
    )
    .bind(searching_before)
    .bind(matched_before)
    .fetch_all(ex)
    .await?;
    Ok(rows.iter().map(|r| r.get("player_id")).collect())
}

// ── Clan matchmaking queue ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClanQueueRow {
    pub clan_id: String,
    pub strength: i32,
    pub selected_members: Vec<i64>,
    pub status: QueueStatus,
    pub matched_with_clan_id: Option<String>,
    pub battle_id: Option<String>,
    pub queue_time: i64,
}

fn clan_queue_from_row(r: &SqliteRow) -> Result<ClanQueueRow, sqlx::Error> {
    let members: String = r.get("selected_members");
    Ok(ClanQueueRow {
        clan_id: r.get("clan_id"),
        strength: r.get("strength"),
        selected_members: serde_json::from_str(&members)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        status: parse(r.get("status"))?,
        matched_with_clan_id: r.get("matched_with_clan_id"),
        battle_id: r.get("battle_id"),
        queue_time: r.get("queue_time"),
    })
}

pub async fn delete_clan_queue_entry(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query("DELETE FROM clan_matchmaking_queue WHERE clan_id = ?1")
        .bind(clan_id)
        .execute(ex)
        .await?;
    Ok(done.rows_affected())
}

pub async fn insert_clan_queue_entry(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
    strength: i32,
    members: &[i64],
) -> Result<(), sqlx::Error> {
    let now = now_millis();
    let members = serde_json::to_string(members).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        "INSERT INTO clan_matchmaking_queue
            (clan_id, strength, selected_members, status, queue_time, updated_at)
         VALUES (?1, ?2, ?3, 'searching', ?4, ?4)",
    )
    .bind(clan_id)
    .bind(strength)
    .bind(members)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_clan_queue_entry(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
) -> Result<Option<ClanQueueRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM clan_matchmaking_queue WHERE clan_id = ?1")
        .bind(clan_id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(clan_queue_from_row).transpose()
}

/// Searching clans except `exclude`, oldest first.
pub async fn searching_clans(
    ex: impl SqliteExecutor<'_>,
    exclude: &str,
) -> Result<Vec<ClanQueueRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM clan_matchmaking_queue
         WHERE status = 'searching' AND clan_id != ?1
         ORDER BY queue_time ASC, rowid ASC",
    )
    .bind(exclude)
    .fetch_all(ex)
    .await?;
    rows.iter().map(clan_queue_from_row).collect()
}

/// `searching -> matched` for one clan row, pointing at `opponent`.
pub async fn match_clan_entry(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
    opponent: &str,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE clan_matchmaking_queue
         SET status = 'matched', matched_with_clan_id = ?2, updated_at = ?3
         WHERE clan_id = ?1 AND status = 'searching'",
    )
    .bind(clan_id)
    .bind(opponent)
    .bind(now_millis())
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn sweep_clan_queue(
    ex: impl SqliteExecutor<'_>,
    searching_before: i64,
    matched_before: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "DELETE FROM clan_matchmaking_queue
         WHERE (status = 'searching' AND queue_time < ?1)
            OR (status != 'searching' AND updated_at < ?2)",
    )
    .bind(searching_before)
    .bind(matched_before)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

// ── 1v1 battles ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BattleRow {
    pub id: String,
    pub kind: BattleKind,
    pub player1_id: i64,
    pub player2_id: i64,
    pub status: BattleStatus,
    pub problem: Option<BattleProblem>,
    pub start_time: Option<i64>,
    pub duration_seconds: i64,
    pub winner_id: Option<i64>,
    pub created_at: i64,
}

impl BattleRow {
    pub fn opponent_of(&self, player_id: i64) -> Option<i64> {
        if self.player1_id == player_id {
            Some(self.player2_id)
        } else if self.player2_id == player_id {
            Some(self.player1_id)
        } else {
            None
        }
    }
}

fn battle_from_row(r: &SqliteRow) -> Result<BattleRow, sqlx::Error> {
    let contest_id: Option<i64> = r.get("contest_id");
    let index: Option<String> = r.get("problem_index");
    let problem = match (contest_id, index) {
        (Some(contest_id), Some(index)) => {
            let tags: Option<String> = r.get("problem_tags");
            Some(BattleProblem {
                key: ProblemKey::new(contest_id, index),
                name: r.get::<Option<String>, _>("problem_name").unwrap_or_default(),
                rating: r.get("problem_rating"),
                tags: tags
                    .map(|t| serde_json::from_str(&t))
                    .transpose()
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
                    .unwrap_or_default(),
            })
        }
        _ => None,
    };

    Ok(BattleRow {
        id: r.get("id"),
        kind: parse(r.get("kind"))?,
        player1_id: r.get("player1_id"),
        player2_id: r.get("player2_id"),
        status: parse(r.get("status"))?,
        problem,
        start_time: r.get("start_time"),
        duration_seconds: r.get("duration_seconds"),
        winner_id: r.get("winner_id"),
        created_at: r.get("created_at"),
    })
}

fn tags_json(problem: Option<&BattleProblem>) -> Result<Option<String>, sqlx::Error> {
    problem
        .map(|p| serde_json::to_string(&p.tags))
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

pub async fn insert_battle(
    ex: impl SqliteExecutor<'_>,
    battle: &BattleRow,
) -> Result<(), sqlx::Error> {
    let problem = battle.problem.as_ref();
    sqlx::query(
        "INSERT INTO battles (id, kind, player1_id, player2_id, status, contest_id,
            problem_index, problem_name, problem_rating, problem_tags, start_time,
            duration_seconds, winner_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )
    .bind(&battle.id)
    .bind(battle.kind.as_str())
    .bind(battle.player1_id)
    .bind(battle.player2_id)
    .bind(battle.status.as_str())
    .bind(problem.map(|p| p.key.contest_id))
    .bind(problem.map(|p| p.key.index.clone()))
    .bind(problem.map(|p| p.name.clone()))
    .bind(problem.and_then(|p| p.rating))
    .bind(tags_json(problem)?)
    .bind(battle.start_time)
    .bind(battle.duration_seconds)
    .bind(battle.winner_id)
    .bind(battle.created_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_battle(ex: impl SqliteExecutor<'_>, id: &str) -> Result<u64, sqlx::Error> {
    let done = sqlx::query("DELETE FROM battles WHERE id = ?1")
        .bind(id)
        .execute(ex)
        .await?;
    Ok(done.rows_affected())
}

pub async fn get_battle(
    ex: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<BattleRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM battles WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(battle_from_row).transpose()
}

/// The non-terminal battle between two players, in either seat order.
pub async fn open_battle_for_pair(
    ex: impl SqliteExecutor<'_>,
    a: i64,
    b: i64,
) -> Result<Option<BattleRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT * FROM battles
         WHERE ((player1_id = ?1 AND player2_id = ?2) OR (player1_id = ?2 AND player2_id = ?1))
           AND status IN ({})
         ORDER BY created_at DESC LIMIT 1",
        open_statuses_sql()
    ))
    .bind(a)
    .bind(b)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(battle_from_row).transpose()
}

/// Most recent non-terminal battle the player sits in.
pub async fn active_battle_for_player(
    ex: impl SqliteExecutor<'_>,
    player_id: i64,
) -> Result<Option<BattleRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT * FROM battles
         WHERE (player1_id = ?1 OR player2_id = ?1) AND status IN ({})
         ORDER BY created_at DESC LIMIT 1",
        open_statuses_sql()
    ))
    .bind(player_id)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(battle_from_row).transpose()
}

/// `request_sent -> active`, setting the problem and stamping `start_time`.
pub async fn activate_challenge(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    problem: &BattleProblem,
    start_time: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE battles
         SET status = 'active', contest_id = ?2, problem_index = ?3, problem_name = ?4,
             problem_rating = ?5, problem_tags = ?6, start_time = ?7
         WHERE id = ?1 AND status = 'request_sent'",
    )
    .bind(id)
    .bind(problem.key.contest_id)
    .bind(&problem.key.index)
    .bind(&problem.name)
    .bind(problem.rating)
    .bind(tags_json(Some(problem))?)
    .bind(start_time)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

/// Move a battle from one of `from` to `to`. Returns rows changed.
pub async fn transition_battle(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    from: &[BattleStatus],
    to: BattleStatus,
    winner_id: Option<i64>,
) -> Result<u64, sqlx::Error> {
    let from = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let done = sqlx::query(&format!(
        "UPDATE battles SET status = ?2, winner_id = ?3 WHERE id = ?1 AND status IN ({from})"
    ))
    .bind(id)
    .bind(to.as_str())
    .bind(winner_id)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

/// Running battles whose clock ran out before `now`.
pub async fn expired_battles(
    ex: impl SqliteExecutor<'_>,
    now: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id FROM battles
         WHERE status IN ('active', 'in_progress')
           AND start_time IS NOT NULL
           AND start_time + duration_seconds * 1000 < ?1",
    )
    .bind(now)
    .fetch_all(ex)
    .await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRow {
    pub battle_id: String,
    pub player_id: i64,
    pub problem_solved: bool,
    pub time_taken: Option<i64>,
    pub rating_change: Option<i32>,
    pub xp_change: Option<f64>,
}

pub async fn insert_participant(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO battle_participants (battle_id, player_id) VALUES (?1, ?2)")
        .bind(battle_id)
        .bind(player_id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn participants(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
) -> Result<Vec<ParticipantRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM battle_participants WHERE battle_id = ?1 ORDER BY player_id",
    )
    .bind(battle_id)
    .fetch_all(ex)
    .await?;
    Ok(rows
        .iter()
        .map(|r| ParticipantRow {
            battle_id: r.get("battle_id"),
            player_id: r.get("player_id"),
            problem_solved: r.get::<i64, _>("problem_solved") != 0,
            time_taken: r.get("time_taken"),
            rating_change: r.get("rating_change"),
            xp_change: r.get("xp_change"),
        })
        .collect())
}

/// Mark a participant solved once. Returns rows changed.
pub async fn mark_solved(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
    time_taken: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE battle_participants SET problem_solved = 1, time_taken = ?3
         WHERE battle_id = ?1 AND player_id = ?2 AND problem_solved = 0",
    )
    .bind(battle_id)
    .bind(player_id)
    .bind(time_taken)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn record_outcome(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
    rating_change: i32,
    xp_change: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE battle_participants SET rating_change = ?3, xp_change = ?4
         WHERE battle_id = ?1 AND player_id = ?2",
    )
    .bind(battle_id)
    .bind(player_id)
    .bind(rating_change)
    .bind(xp_change)
    .execute(ex)
    .await?;
    Ok(())
}

// ── Clan battles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClanBattleRow {
    pub id: String,
    pub clan1_id: String,
    pub clan2_id: String,
    pub status: BattleStatus,
    pub start_time: Option<i64>,
    pub duration_seconds: i64,
    pub winner_clan_id: Option<String>,
    pub created_at: i64,
}

fn clan_battle_from_row(r: &SqliteRow) -> Result<ClanBattleRow, sqlx::Error> {
    Ok(ClanBattleRow {
        id: r.get("id"),
        clan1_id: r.get("clan1_id"),
        clan2_id: r.get("clan2_id"),
        status: parse(r.get("status"))?,
        start_time: r.get("start_time"),
        duration_seconds: r.get("duration_seconds"),
        winner_clan_id: r.get("winner_clan_id"),
        created_at: r.get("created_at"),
    })
}

pub async fn insert_clan_battle(
    ex: impl SqliteExecutor<'_>,
    battle: &ClanBattleRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO clan_battles (id, clan1_id, clan2_id, status, start_time,
            duration_seconds, winner_clan_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&battle.id)
    .bind(&battle.clan1_id)
    .bind(&battle.clan2_id)
    .bind(battle.status.as_str())
    .bind(battle.start_time)
    .bind(battle.duration_seconds)
    .bind(&battle.winner_clan_id)
    .bind(battle.created_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_clan_battle(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<u64, sqlx::Error> {
    for table in ["clan_battle_solves", "clan_battle_problems", "clan_battle_participants"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE battle_id = ?1"))
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    let done = sqlx::query("DELETE FROM clan_battles WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected())
}

pub async fn get_clan_battle(
    ex: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<ClanBattleRow>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM clan_battles WHERE id = ?1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(clan_battle_from_row).transpose()
}

pub async fn open_clan_battle_for_pair(
    ex: impl SqliteExecutor<'_>,
    a: &str,
    b: &str,
) -> Result<Option<ClanBattleRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT * FROM clan_battles
         WHERE ((clan1_id = ?1 AND clan2_id = ?2) OR (clan1_id = ?2 AND clan2_id = ?1))
           AND status IN ('preparing', 'in_progress')
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(a)
    .bind(b)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(clan_battle_from_row).transpose()
}

pub async fn active_clan_battle(
    ex: impl SqliteExecutor<'_>,
    clan_id: &str,
) -> Result<Option<ClanBattleRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT * FROM clan_battles
         WHERE (clan1_id = ?1 OR clan2_id = ?1) AND status IN ('preparing', 'in_progress')
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(clan_id)
    .fetch_optional(ex)
    .await?;
    row.as_ref().map(clan_battle_from_row).transpose()
}

/// `preparing -> in_progress`, stamping `start_time` only on that first transition.
pub async fn start_clan_battle(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    start_time: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE clan_battles SET status = 'in_progress', start_time = ?2
         WHERE id = ?1 AND status = 'preparing'",
    )
    .bind(id)
    .bind(start_time)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn finish_clan_battle(
    ex: impl SqliteExecutor<'_>,
    id: &str,
    to: BattleStatus,
    winner_clan_id: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "UPDATE clan_battles SET status = ?2, winner_clan_id = ?3
         WHERE id = ?1 AND status IN ('preparing', 'in_progress')",
    )
    .bind(id)
    .bind(to.as_str())
    .bind(winner_clan_id)
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn expired_clan_battles(
    ex: impl SqliteExecutor<'_>,
    now: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id FROM clan_battles
         WHERE status = 'in_progress' AND start_time + duration_seconds * 1000 < ?1",
    )
    .bind(now)
    .fetch_all(ex)
    .await?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

pub async fn insert_clan_participant(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
    clan_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO clan_battle_participants (battle_id, player_id, clan_id) VALUES (?1, ?2, ?3)",
    )
    .bind(battle_id)
    .bind(player_id)
    .bind(clan_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn clan_participant_clan(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT clan_id FROM clan_battle_participants WHERE battle_id = ?1 AND player_id = ?2",
    )
    .bind(battle_id)
    .bind(player_id)
    .fetch_optional(ex)
    .await?;
    Ok(row.map(|r| r.get("clan_id")))
}

pub async fn insert_clan_problems(
    conn: &mut SqliteConnection,
    battle_id: &str,
    problems: &[ClanProblem],
) -> Result<(), sqlx::Error> {
    for p in problems {
        sqlx::query(
            "INSERT INTO clan_battle_problems
                (battle_id, position, contest_id, problem_index, name, rating, points)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(battle_id)
        .bind(p.position)
        .bind(p.key.contest_id)
        .bind(&p.key.index)
        .bind(&p.name)
        .bind(p.rating)
        .bind(p.points)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn clan_problems(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
) -> Result<Vec<ClanProblem>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM clan_battle_problems WHERE battle_id = ?1 ORDER BY position",
    )
    .bind(battle_id)
    .fetch_all(ex)
    .await?;
    Ok(rows
        .iter()
        .map(|r| ClanProblem {
            position: r.get("position"),
            key: ProblemKey::new(r.get::<i64, _>("contest_id"), r.get::<String, _>("problem_index")),
            name: r.get("name"),
            rating: r.get("rating"),
            points: r.get("points"),
        })
        .collect())
}

/// Record the first solve of a problem by a clan. Returns rows inserted.
pub async fn insert_clan_solve(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    clan_id: &str,
    position: i64,
    player_id: i64,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        "INSERT INTO clan_battle_solves (battle_id, clan_id, position, player_id, solved_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (battle_id, clan_id, position) DO NOTHING",
    )
    .bind(battle_id)
    .bind(clan_id)
    .bind(position)
    .bind(player_id)
    .bind(now_millis())
    .execute(ex)
    .await?;
    Ok(done.rows_affected())
}

pub async fn bump_clan_participant(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
    player_id: i64,
    time_taken: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE clan_battle_participants
         SET problems_solved = problems_solved + 1, time_taken = time_taken + ?3
         WHERE battle_id = ?1 AND player_id = ?2",
    )
    .bind(battle_id)
    .bind(player_id)
    .bind(time_taken)
    .execute(ex)
    .await?;
    Ok(())
}

/// Per-clan totals: (clan_id, problems solved, time taken).
pub async fn clan_scores(
    ex: impl SqliteExecutor<'_>,
    battle_id: &str,
) -> Result<Vec<(String, i64, i64)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT clan_id, SUM(problems_solved) AS solved, SUM(time_taken) AS time_taken
         FROM clan_battle_participants WHERE battle_id = ?1 GROUP BY clan_id",
    )
    .bind(battle_id)
    .fetch_all(ex)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("clan_id"), r.get("solved"), r.get("time_taken")))
        .collect())
}
