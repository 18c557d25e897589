use airlock_contracts::{SystemEvent, events};
use airlock_gateway::{config, http};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let state = match http::build_state(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    let initialized = SystemEvent::new(
        events::APP_INITIALIZED,
        serde_json::json!({
            "bindAddr": config.bind_addr.to_string(),
            "keyServer": config.key_server,
            "formatVersion": config.format_version,
        }),
        serde_json::Value::Null,
    );
    http::dispatch(&state, &initialized);

    let bus = state.bus();
    let app = http::router_with_state(state);

    tracing::info!(bind_addr = %config.bind_addr, "airlock-gateway listening");

    let served = axum::serve(listener, app).await;
    bus.shutdown();
    if let Err(err) = served {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        std::process::exit(1);
    }
}
