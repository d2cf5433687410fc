use async_trait::async_trait;
use rabbitmq_consumer::{
    ConsumerService, HandlerError, HandlerRegistry, MessageHandler, WorkerConfig, WorkerError,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// 1. Define your message struct
#[derive(Deserialize, Debug, Clone)]
struct BuildRequest {
    project: String,
    id: u32,
}

// 2. Implement the `MessageHandler` trait for your logic
struct BuildHandler;

#[async_trait]
impl MessageHandler for BuildHandler {
    type MessageType = BuildRequest;

    fn handler_name(&self) -> &str {
        "BuildHandler"
    }

    async fn handle_message(&self, message: Self::MessageType) -> Result<(), HandlerError> {
        log::info!("Building '{}' (request {})", message.project, message.id);

        if message.id == 99 {
            log::info!("Simulating a long-running build...");
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        // Odd ids stand in for a build cache that is not ready yet; the
        // message goes back on the queue.
        if message.id % 2 != 0 {
            return Err(HandlerError::Environment(format!(
                "build cache unavailable for request {}",
                message.id
            )));
        }

        log::info!("Build {} finished", message.id);
        Ok(())
    }
}

// 3. Configure and run the consumer
//
// Reads RABBITMQ_HOST, RABBITMQ_QUEUE_NAME, RABBITMQ_PORT, ... from the
// environment, falling back to a local broker. Publish to the exchange with
// routing keys like `demo_queue.request.build` or `demo_queue.request.ping`.
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match WorkerConfig::from_env("RABBITMQ") {
        Ok(config) => config,
        Err(e) => {
            log::info!("No environment configuration ({}), using localhost", e);
            WorkerConfig::builder("demo_queue", "localhost")
                .dead_letter(true)
                .build()
        }
    };
    log::info!("Using RabbitMQ at {}", config.endpoint);

    let mut registry = HandlerRegistry::new();
    registry
        .register_json(["build"], BuildHandler)
        .register_fn(["ping"], |payload: Vec<u8>| async move {
            log::info!("pong: {}", String::from_utf8_lossy(&payload));
            Ok(())
        });

    let handle = ConsumerService::new(config, Arc::new(registry))?.start();

    // Listen for Ctrl+C for graceful shutdown
    let shutdown = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received. Shutting down.");
            shutdown.cancel();
        }
    });

    handle.join().await?;
    log::info!("Application has shut down.");
    Ok(())
}
