pub mod battle;
pub mod clan_matchmaking;
pub mod config;
pub mod db;
pub mod error;
pub mod matchmaking;
pub mod notify;
pub mod provider;
pub mod rating;
pub mod routes;
pub mod selector;
pub mod state;
pub mod verdict;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use axum::Router;
use axum::routing::{get, post};
use dashmap::DashMap;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::db::now_millis;
use crate::notify::Notifier;
use crate::provider::{CodeRunner, CodeforcesClient, PistonClient, ProblemProvider};
use crate::state::AppState;

/// Build a fully configured Router + shared state talking to the real judge and runner.
pub async fn build_app(config: Config) -> Result<(Router, Arc<AppState>), sqlx::Error> {
    let problems = Arc::new(CodeforcesClient::new(config.codeforces_api_url.clone()));
    let runner = Arc::new(PistonClient::new(config.piston_url.clone()));
    build_app_with(config, problems, runner).await
}

/// Same as `build_app` with the external collaborators supplied by the caller.
pub async fn build_app_with(
    config: Config,
    problems: Arc<dyn ProblemProvider>,
    runner: Arc<dyn CodeRunner>,
) -> Result<(Router, Arc<AppState>), sqlx::Error> {
    let pool = db::connect(&config.database_url).await?;

    let state = Arc::new(AppState {
        db: pool,
        notifier: Notifier::new(),
        problems,
        runner,
        config,
        connections: DashMap::new(),
        connection_count: AtomicU32::new(0),
    });

    {
        let state = state.clone();
        tokio::spawn(async move {
            let period = state.config.timings.cleanup_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                cleanup(&state).await;
            }
        });
    }

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/players", post(routes::register))
        .route("/players/{handle}", get(routes::profile))
        .route("/players/{handle}/battle", get(routes::active_battle))
        .route("/leaderboard", get(routes::leaderboard))
        .route("/clans", post(routes::create_clan))
        .route("/clans/{id}/members", post(routes::join_clan))
        .route("/battles/{id}", get(routes::get_battle))
        .route("/challenges", post(routes::create_challenge))
        .route("/challenges/{id}/accept", post(routes::accept_challenge))
        .route("/challenges/{id}/decline", post(routes::decline_challenge))
        .route("/clan-battles/{id}", get(routes::get_clan_battle))
        .route("/clan-battles/{id}/start", post(routes::start_clan_battle))
        .route("/clan-battles/{id}/complete", post(routes::complete_clan_battle))
        .route("/practice/rush", get(routes::rush))
        .route("/practice/run", post(routes::run))
        .route("/ws", get(routes::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    Ok((app, state))
}

/// Drop stale queue rows and close battles whose clock ran out.
pub async fn cleanup(state: &AppState) {
    let timings = &state.config.timings;
    let now = now_millis();
    let searching_before = now - timings.matchmaking_timeout.as_millis() as i64;
    let matched_before = now - timings.matched_grace.as_millis() as i64;

    match db::sweep_queue(&state.db, searching_before, matched_before).await {
        Ok(swept) if !swept.is_empty() => {
            tracing::info!(count = swept.len(), "swept stale queue rows");
            for player_id in swept {
                state.notifier.publish(notify::RowChange::Queue {
                    player_id,
                    status: None,
                    battle_id: None,
                });
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "queue sweep failed"),
    }

    match db::sweep_clan_queue(&state.db, searching_before, matched_before).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "swept stale clan queue rows"),
        Err(e) => tracing::warn!(error = %e, "clan queue sweep failed"),
    }

    match battle::sweep_expired(state).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "closed expired battles"),
        Err(e) => tracing::warn!(error = %e, "battle expiry sweep failed"),
    }
}
