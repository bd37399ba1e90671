use dispatchd::api::ApiServer;
use dispatchd::collector::Collector;
use dispatchd::config::ControllerConfig;
use dispatchd::event_bus::EventBus;
use dispatchd::monitoring::Monitor;
use dispatchd::presence;
use dispatchd::reporter::LoggingReporter;
use dispatchd::scheduler::Scheduler;
use dispatchd::store::Store;
use dispatchd::Result;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("starting dispatchd controller");

    let config = ControllerConfig::load()?;
    let presence_timeout_secs = config.presence_timeout_secs();

    let events = Arc::new(EventBus::new());
    let store = Arc::new(Store::open(&config.store.database_path, events.clone())?);
    let scheduler = Arc::new(Scheduler::new(store.clone(), events.clone(), &config.scheduler, presence_timeout_secs));
    let collector = Arc::new(Collector::new(
        store.clone(),
        events.clone(),
        scheduler.clone(),
        Arc::new(LoggingReporter),
    ));
    let monitor = Arc::new(Monitor::new(store.clone(), presence_timeout_secs));

    let api_server = Arc::new(ApiServer::new(
        config.api.host.clone(),
        config.api.port,
        config.api.allowed_origins.clone(),
        store.clone(),
        events.clone(),
        scheduler.clone(),
        collector,
    ));

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "api server failed");
            }
        }
        _ = scheduler.run() => {
            tracing::error!("scheduler loop exited unexpectedly");
        }
        _ = presence::run_reaper(store, events, presence_timeout_secs) => {
            tracing::error!("presence reaper exited unexpectedly");
        }
        _ = monitor.run() => {
            tracing::error!("monitoring loop exited unexpectedly");
        }
    }

    Ok(())
}
