use charla::clog;
use charla::logging;
use charla::relay::{app, ConversationLog, RelayConfig, RelayState};

fn env_var(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    logging::init();

    let bind = env_var("CHARLA_RELAY_BIND", "0.0.0.0:3000");
    let config = RelayConfig {
        shared_secret: env_var("CHARLA_RELAY_SECRET", charla::auth::DEFAULT_SHARED_SECRET),
        no_auth: env_var("CHARLA_RELAY_NO_AUTH", "") == "1",
    };
    if config.no_auth {
        clog!("authentication disabled, accepting anonymous connections");
    }

    let state = RelayState::new(config, ConversationLog::new());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind}: {err}"));
    clog!("relay listening on {bind}");
    axum::serve(listener, app(state))
        .await
        .expect("relay server failed");
}
