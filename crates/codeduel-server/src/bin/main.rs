use codeduel_server::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(
        database = %config.database_url,
        judge = %config.codeforces_api_url,
        runner = %config.piston_url,
        "starting codeduel server"
    );

    let (app, _state) = codeduel_server::build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
