use std::time::Duration;

/// Intervals and bounds of every polling protocol.
#[derive(Debug, Clone)]
pub struct Timings {
    /// How often a searching player re-checks the queue.
    pub queue_poll_interval: Duration,
    /// Overall bound on a matchmaking search.
    pub matchmaking_timeout: Duration,
    /// How many times the non-creating clan checks for the battle.
    pub clan_wait_attempts: u32,
    pub clan_wait_interval: Duration,
    pub verdict_attempts: u32,
    pub verdict_interval: Duration,
    /// Matched queue rows are swept after this long.
    pub matched_grace: Duration,
    pub cleanup_interval: Duration,
    pub battle_duration_secs: i64,
    pub clan_battle_duration_secs: i64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_secs(1),
            matchmaking_timeout: Duration::from_secs(60),
            clan_wait_attempts: 15,
            clan_wait_interval: Duration::from_secs(1),
            verdict_attempts: 40,
            verdict_interval: Duration::from_secs(3),
            matched_grace: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            battle_duration_secs: 30 * 60,
            clan_battle_duration_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub max_connections: u32,
    pub codeforces_api_url: String,
    pub piston_url: String,
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:codeduel.db?mode=rwc".to_string(),
            port: 8080,
            max_connections: 100,
            codeforces_api_url: "https://codeforces.com/api".to_string(),
            piston_url: "https://emkc.org/api/v2/piston".to_string(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Read overrides from the environment; anything unset keeps its default.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            port: env_parse("PORT").unwrap_or(defaults.port),
            max_connections: env_parse("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            codeforces_api_url: std::env::var("CODEFORCES_API_URL")
                .unwrap_or(defaults.codeforces_api_url),
            piston_url: std::env::var("PISTON_URL").unwrap_or(defaults.piston_url),
            timings: defaults.timings,
        }
    }

    /// An in-memory database with every interval shortened.
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            timings: Timings {
                queue_poll_interval: Duration::from_millis(20),
                matchmaking_timeout: Duration::from_secs(3),
                clan_wait_attempts: 15,
                clan_wait_interval: Duration::from_millis(20),
                verdict_attempts: 5,
                verdict_interval: Duration::from_millis(10),
                matched_grace: Duration::from_secs(30),
                cleanup_interval: Duration::from_secs(3600),
                ..Timings::default()
            },
            ..Config::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
