use std::time::Duration;

use axum::{extract::State, routing::get, Router};
use envconfig::Envconfig;
use procrastinate_core::JobStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod janitor;

use config::Config;
use janitor::Janitor;

async fn cleanup_loop(janitor: Janitor, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        if let Err(e) = janitor.run_once().await {
            // A few failed rounds are survivable; stalled jobs just wait a
            // little longer.
            error!("janitor failed cleanup with: {}", e);
        }
    }
}

async fn listen(app: Router, bind: String) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

// For axums state stuff
#[derive(Clone)]
struct JanitorId(pub String);

fn app(janitor_id: String) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .with_state(JanitorId(janitor_id))
}

async fn index(State(janitor_id): State<JanitorId>) -> String {
    format!("procrastinate janitor {}", janitor_id.0)
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = format!("{}:{}", config.host, config.port);
    let cleanup_interval_secs = config.cleanup_interval_secs;
    let (settings, pool_config, janitor_id) = config.to_components();

    info!(
        "Starting janitor with ID {:?}, listening at {}",
        janitor_id, bind
    );

    let store = JobStore::connect(&pool_config)
        .await
        .expect("failed to connect to the database");
    let janitor = Janitor::new(store, settings);

    janitor.run_migrations().await;

    let janitor_loop = tokio::spawn(cleanup_loop(janitor, cleanup_interval_secs));

    let http_server = tokio::spawn(listen(app(janitor_id), bind));

    tokio::select! {
        res = janitor_loop => {
            error!("janitor loop exited");
            if let Err(e) = res {
                error!("janitor failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
}
