use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trip_supervisor::{
    api::start_server,
    audit::AuditLog,
    handlers::{
        CatalogSearchHandler, Handler, HandlerRegistry, IcsCalendarHandler, RemoteHandler,
        SummaryShareHandler, TemplatePlanner,
    },
    state::InMemorySessionStore,
    HandlerId, SessionManager, Supervisor, SupervisorConfig,
};

/// Built-in handler unless `TRIP_<ID>_HANDLER_URL` points at a remote one
fn build_registry(config: &SupervisorConfig) -> Result<HandlerRegistry, Box<dyn std::error::Error>> {
    let mut registry = HandlerRegistry::new();

    for id in HandlerId::all() {
        let handler: Arc<dyn Handler> = match RemoteHandler::from_env(id, config.handler_timeout) {
            Some(remote) => {
                let remote = remote?;
                info!(handler = %id, endpoint = %remote.endpoint(), "Using remote handler");
                Arc::new(remote)
            }
            None => match id {
                HandlerId::Search => Arc::new(CatalogSearchHandler::new()),
                HandlerId::Planner => Arc::new(TemplatePlanner::new()),
                HandlerId::Calendar => Arc::new(IcsCalendarHandler::new()),
                HandlerId::Share => Arc::new(SummaryShareHandler::new()),
            },
        };
        registry.register(handler)?;
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let config = SupervisorConfig::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "Invalid supervisor configuration, using defaults");
        SupervisorConfig::default()
    });

    info!("Trip Supervisor - API Server");
    info!(
        port = api_port,
        max_turns = config.max_turns,
        handler_timeout_secs = config.handler_timeout.as_secs(),
        "Configuration loaded"
    );

    let registry = build_registry(&config)?;
    let supervisor = Supervisor::new(registry, config, AuditLog::new());
    let sessions = Arc::new(SessionManager::new(
        Arc::new(supervisor),
        Box::new(InMemorySessionStore::new()),
    ));

    info!("Supervisor initialized, starting API server");

    start_server(sessions, api_port).await?;

    Ok(())
}
