//! Run jobs out of an in-process `taskforge-memory` store, subject to the
//! election/application pipeline and the automatic-retry filter.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use taskforge_core::filter::FilterRegistry;
use taskforge_core::health::HealthRegistry;
use taskforge_core::job::Invocation;
use taskforge_core::metrics::{serve, setup_metrics_router};
use taskforge_core::retry::AutomaticRetryFilter;
use taskforge_memory::MemoryStore;

mod config;
mod demo;
mod error;
mod worker;

use config::Config;
use error::WorkerError;
use worker::{HandlerRegistry, Worker};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let retry_filter = AutomaticRetryFilter::new();
    retry_filter.set_attempts(config.retry.attempts);
    retry_filter.set_on_attempts_exceeded(config.retry.on_attempts_exceeded.0);
    retry_filter.set_log_events(config.retry.log_events);
    let retry_filter = Arc::new(retry_filter);

    let registry = Arc::new(FilterRegistry::new());
    registry.register_election(retry_filter.clone());
    registry.register_application(retry_filter);

    let store = MemoryStore::new();
    store.enqueue(
        uuid::Uuid::now_v7().to_string(),
        Invocation {
            method: "echo".to_owned(),
            arguments: vec![serde_json::json!("hello")],
        },
    );
    store.enqueue(
        uuid::Uuid::now_v7().to_string(),
        Invocation {
            method: "always-fails".to_owned(),
            arguments: vec![],
        },
    );

    let mut handlers = HandlerRegistry::new();
    handlers.register("echo", Arc::new(demo::EchoHandler));
    handlers.register("always-fails", Arc::new(demo::AlwaysFailsHandler));
    let handlers = Arc::new(handlers);

    let worker = Worker::new(
        &config.worker_name,
        store,
        registry,
        handlers,
        config.poll_interval.0,
        config.max_concurrent_jobs,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "taskforge worker"
}
