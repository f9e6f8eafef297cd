//! RabbitMQ worker binary.
//!
//! Wires the pipeline to a broker from environment variables and runs it
//! under the connection supervisor until Ctrl-C. The handler here is a
//! plain echo: real deployments depend on the library and plug in their
//! own [`ConversationHandler`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use courier::config::Config;
use courier::consumer::ConversationHandler;
use courier::message::InboundMessage;
use courier::policy::HandlerError;
use courier::supervisor::Supervisor;

/// Placeholder handler: replies with the inbound text.
struct Echo;

#[async_trait::async_trait]
impl ConversationHandler for Echo {
    async fn handle(&self, message: &InboundMessage) -> Result<String, HandlerError> {
        match (&message.text, &message.sender_name) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(name)) => Ok(format!("Hello {name}, I did not catch that.")),
            (None, None) => Ok("I did not catch that.".to_owned()),
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
        })
    };

    tracing::info!(url = %config.amqp_url, queue = %config.input_queue, "Starting worker");
    Supervisor::new(config, Arc::new(Echo)).run(cancel).await;

    signal.abort();
    tracing::info!("Worker stopped");
}
