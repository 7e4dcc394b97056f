use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::http::{Method, header};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use course_server::{
    api::{self, AppState},
    config::Config,
    db,
    utils::init_log,
};
use rustls::crypto::{CryptoProvider, aws_lc_rs};
use tower_http::{
    compression::{
        CompressionLayer, Predicate,
        predicate::{DefaultPredicate, NotForContentType},
    },
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tower_sessions::{
    Expiry, SessionManagerLayer, cookie::time::Duration as SessionDuration,
    session_store::ExpiredDeletion,
};
use tower_sessions_sqlx_store::SqliteStore;
use tracing::info;

#[derive(Debug, Parser)]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    database: Option<String>,
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(database) = args.database {
        config.database_url = database;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let _guard = init_log(config.log_dir.clone())?;

    let database = db::connect(&config.database_url).await?;

    let session_store = SqliteStore::new(database.clone());
    session_store.migrate().await?;
    let deletion_task = tokio::task::spawn(
        session_store
            .clone()
            .continuously_delete_expired(Duration::from_secs(60)),
    );
    let sessions = SessionManagerLayer::new(session_store)
        .with_secure(config.tls.is_some())
        .with_expiry(Expiry::OnInactivity(SessionDuration::hours(
            config.session_ttl_hours,
        )));

    let cors = CorsLayer::new()
        .allow_origin(config.allowed_origins()?)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE]);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let tls = config.tls.clone();
    let state = Arc::new(AppState::new(database, config).await?);
    // range requests on videos must see the stored bytes
    let compress = DefaultPredicate::new().and(NotForContentType::const_new("video/"));
    let app = api::router(state)
        .layer(sessions)
        .layer(CompressionLayer::new().compress_when(compress))
        .layer(cors)
        .layer(TimeoutLayer::new(Duration::from_secs(300)))
        .layer(TraceLayer::new_for_http());

    match tls {
        Some(tls) => {
            CryptoProvider::install_default(aws_lc_rs::default_provider()).map_err(|e| {
                anyhow::anyhow!("Failed to initialize rustls crypto provider: {:?}", e)
            })?;
            let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
            info!("listening on https://{addr}, Swagger UI at /swagger-ui");
            axum_server::bind_rustls(addr, rustls)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("listening on http://{addr}, Swagger UI at /swagger-ui");
            axum::serve(listener, app).await?;
        }
    }
    deletion_task.abort();
    Ok(())
}
