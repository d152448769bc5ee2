//! Runtime wiring for the service roles.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobflow_events::{ClientResolver, Notifier, Subscription};
use jobflow_infra::broker::RedisStreamsBroker;
use jobflow_infra::{
    ClientHub, EventPublisher, NotificationDispatcher, PoolStats, RedisClientResolver,
    WebhookNotifier, Worker,
};

use crate::config::{Role, ServiceConfig};
use crate::processors::default_registry;

/// Connect to the broker and run the configured role until `cancel` fires.
///
/// Fails when the broker is unreachable at startup or fails unrecoverably while
/// running.
pub async fn run(config: ServiceConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let broker = RedisStreamsBroker::connect(&config.redis_url)
        .await
        .with_context(|| format!("connecting to {}", config.redis_url))?;

    let topology = &config.topology;
    let stats = match config.role {
        Role::Worker => {
            let subscription: Arc<dyn Subscription> = Arc::new(
                broker
                    .subscribe(&topology.job_topic, &topology.worker_group, &topology.consumer_name)
                    .await?,
            );
            let publisher = EventPublisher::new(
                Arc::new(broker.topic(&topology.event_topic)),
                config.pipeline.publish,
            );
            Worker::run(
                cancel,
                subscription,
                Arc::new(default_registry()),
                publisher,
                config.pipeline.clone(),
            )
            .await?
        }
        Role::Dispatcher => {
            let subscription: Arc<dyn Subscription> = Arc::new(
                broker
                    .subscribe(
                        &topology.event_topic,
                        &topology.dispatcher_group,
                        &topology.consumer_name,
                    )
                    .await?,
            );
            let resolver: Arc<dyn ClientResolver> = Arc::new(RedisClientResolver::new(
                broker.connection(),
                config.client_map_key.clone(),
            ));
            let dispatcher = Arc::new(NotificationDispatcher::new(resolver, notifier(&config)?));
            dispatcher.run(cancel, subscription, &config.pipeline).await?
        }
    };

    log_stats(config.role, &stats);
    Ok(())
}

fn notifier(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.webhook {
        Some(webhook) => {
            info!(url = %webhook.url, signed = webhook.secret.is_some(), "notifying via webhook relay");
            Ok(Arc::new(WebhookNotifier::new(webhook.clone())?))
        }
        None => {
            warn!("JOBFLOW_WEBHOOK_URL not set; only in-process clients can be notified");
            Ok(Arc::new(ClientHub::new()))
        }
    }
}

fn log_stats(role: Role, stats: &PoolStats) {
    info!(
        ?role,
        received = stats.received,
        acked = stats.acked,
        dead_lettered = stats.dead_lettered,
        nacked = stats.nacked,
        aborted = stats.aborted,
        "shutdown complete"
    );
}

/// Cancel `cancel` on SIGINT or SIGTERM.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}
