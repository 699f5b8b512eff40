use axum::{extract::State, routing::get, Router};
use envconfig::Envconfig;
use procrastinate_core::builtins::register_builtin_tasks;
use procrastinate_core::{
    queue_channel, Connector, JobStore, NotificationHub, PeriodicDeferrer, TaskRegistry, Worker,
    ANY_QUEUE_CHANNEL,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

async fn listen(app: Router, bind: String) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

// For axums state stuff
#[derive(Clone)]
struct WorkerId(pub String);

fn app(worker_id: String) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .with_state(WorkerId(worker_id))
}

async fn index(State(worker_id): State<WorkerId>) -> String {
    format!("procrastinate worker {}", worker_id.0)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        _ = ctrl_c.await;
    }
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
    let (worker_config, pool_config) = config.to_components();
    let worker_id = worker_config.worker_id.clone();
    let timezone = worker_config.timezone;
    let listen_notify = worker_config.listen_notify;
    let queues = worker_config.queues.clone();

    info!(
        "Worker starting with ID {:?}, listening at {}",
        worker_id, bind
    );

    let connector = Connector::connect(&pool_config)
        .await
        .expect("failed to connect to the database");
    let store = JobStore::from_pool(connector.pool().clone());

    let mut registry = TaskRegistry::new();
    register_builtin_tasks(&mut registry);

    let deferrer_shutdown = CancellationToken::new();
    let deferrer = PeriodicDeferrer::new(
        store.clone(),
        &registry,
        timezone,
        deferrer_shutdown.clone(),
    );

    let worker = Worker::new(store, registry, worker_config);
    let worker_shutdown = worker.shutdown_token();

    let listener_shutdown = CancellationToken::new();
    // The hub is kept alive for the lifetime of the process; dropping it
    // stops the LISTEN task.
    let (worker, _hub): (Worker, Option<NotificationHub>) = if listen_notify {
        let channels = match &queues {
            Some(queues) => queues.iter().map(|queue| queue_channel(queue)).collect(),
            None => vec![ANY_QUEUE_CHANNEL.to_owned()],
        };
        let hub = connector.start_listener(channels, listener_shutdown.clone());
        let receiver = hub.subscribe();
        (worker.with_notifications(receiver), Some(hub))
    } else {
        (worker, None)
    };

    {
        let worker_shutdown = worker_shutdown.clone();
        let deferrer_shutdown = deferrer_shutdown.clone();
        let listener_shutdown = listener_shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal, draining");
            worker_shutdown.cancel();
            deferrer_shutdown.cancel();
            listener_shutdown.cancel();
        });
    }

    let worker_task = tokio::spawn(worker.run());
    let deferrer_task = tokio::spawn(deferrer.run());
    let http_server = tokio::spawn(listen(app(worker_id), bind));

    tokio::select! {
        res = worker_task => {
            match res {
                Ok(Ok(())) => info!("worker drained"),
                Ok(Err(e)) => error!("worker failed with: {}", e),
                Err(e) => error!("worker task panicked: {}", e),
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    deferrer_shutdown.cancel();
    if let Err(e) = deferrer_task.await {
        error!("periodic deferrer task panicked: {}", e)
    }

    info!("exiting");
}
