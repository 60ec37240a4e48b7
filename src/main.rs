use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use rabbitmq_adapter::config::Config;
use rabbitmq_adapter::logging;
use rabbitmq_adapter::messaging::{AmqpTransport, BrokerAdapter, ConsumeOptions, QueueArguments};
use rabbitmq_adapter::metrics::{Metrics, server::start_metrics_server};
use rabbitmq_adapter::worker::EventHandler;

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    logging::init(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = %config.queue_name,
        "RabbitMQ adapter worker starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let transport = AmqpTransport::new();
    let adapter =
        match BrokerAdapter::connect(&transport, &config.connection, &config.retry, metrics).await
        {
            Ok(adapter) => adapter,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        };

    let dlq_name = format!("{}.dlq", config.queue_name);
    let dlq_args = QueueArguments::new().durable(true);
    let main_args = QueueArguments::new()
        .durable(true)
        .dead_letter_exchange("")
        .dead_letter_routing_key(dlq_name.clone());

    if let Err(e) = adapter.declare_queues([&dlq_name], Some(&dlq_args)).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
    if let Err(e) = adapter
        .declare_queues([&config.queue_name], Some(&main_args))
        .await
    {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        warn!("Shutdown signal received, cleaning up...");
        shutdown_clone.notify_one();
    });

    info!("Ready to process messages");

    let options = ConsumeOptions::new(config.prefetch_count)
        .with_consumer_tag(format!("{}-consumer", config.service_name));
    let consumed = adapter
        .consume_with(&config.queue_name, Arc::new(EventHandler::new()), shutdown, options)
        .await;

    if let Err(e) = adapter.close().await {
        error!(error = %e, "Error during shutdown");
    }

    match consumed {
        Ok(()) => info!("RabbitMQ adapter worker stopped"),
        Err(e) => {
            error!(error = %e, "Consumer terminated");
            std::process::exit(1);
        }
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
