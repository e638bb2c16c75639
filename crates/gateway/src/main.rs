use lexlead_gateway::config::{GatewayConfig, StartupError};
use lexlead_gateway::http;

fn fail(err: StartupError) -> ! {
    eprintln!("STARTUP_ERROR {}", err);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::load().unwrap_or_else(|err| fail(err));
    let bind_addr = config.bind_addr;

    let app = http::router(config).await.unwrap_or_else(|err| fail(err));

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => fail(StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("cannot bind {bind_addr}: {err}"),
        }),
    };

    tracing::info!(%bind_addr, "lexlead-gateway listening");

    if let Err(err) = axum::serve(listener, app).await {
        fail(StartupError {
            code: "ERR_SERVER_FAILED",
            message: err.to_string(),
        });
    }
}
