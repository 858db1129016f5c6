use overhaul_server::{api, auth, database, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overhaul_server=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();

    let pool = database::connect(&config).await?;
    database::run_migrations(&pool).await?;
    auth::bootstrap_admin(&pool, &config).await?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config);
    let app = api::build_router(state);

    tracing::info!("starting overhaul sync server on {bind_address}");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
