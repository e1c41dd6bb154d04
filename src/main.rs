use anyhow::Result;
use axum::response::Response;
use axum::routing::put;
use axum::Router;
use bindgate::server::{AppState, Server};
use bindgate::{traverse_record, Config, Envelope, Fields, Schema};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
struct EchoBody {
    #[validate(length(min = 1, max = 1024))]
    message: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default)]
struct EchoRequest {
    id: String,
    body: EchoBody,
}

impl Schema for EchoRequest {
    fn fields() -> Fields<Self> {
        Fields::<Self>::new()
            .text("id", "path=id", |s| &s.id, |s| &mut s.id)
            .value("body", "body=json", |s| &s.body, |s| &mut s.body)
    }
}

#[derive(Debug, Serialize, Validate)]
struct EchoResponse {
    #[validate(length(min = 1))]
    id: String,
    message: String,
    tags: Vec<String>,
    trace_id: String,
}

traverse_record!(EchoBody, EchoResponse);

async fn echo(mut envelope: Envelope<EchoRequest, EchoResponse>) -> Response {
    let input = match envelope.parse_request().await {
        Ok(input) => input,
        Err(err) => return envelope.send_json_error(err),
    };

    let response = EchoResponse {
        id: input.id,
        message: input.body.message,
        tags: input.body.tags,
        trace_id: envelope.trace().request_id().to_string(),
    };
    envelope.send_json(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("bindgate={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Configuration: bind_addr={}, redis={}, rate_limit={}/{}s",
        config.bind_addr,
        config.redis_url.is_some(),
        config.rate_limit,
        config.rate_limit_window_secs
    );

    let state = AppState::from_config(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;
    state.binder().register::<EchoRequest>()?;

    let routes = Router::new().route("/echo/:id", put(echo));

    Server::new(&config, state, routes)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
