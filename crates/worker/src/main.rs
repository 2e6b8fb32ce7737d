use std::sync::Arc;

use anyhow::Context;

use echoboard_infra::jobs::{Channel, MaintenanceTask, RedisJobStore, RedisSettings};
use echoboard_infra::notifications::ResendMailer;
use echoboard_infra::{
    LoggingMaintenance, QueueService, ServiceCollaborators, StaticReminderAudience, WorkerConfig,
};
use echoboard_observability::LogSettings;

#[tokio::main]
async fn main() {
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            echoboard_observability::init(&LogSettings::default());
            tracing::error!(error = %err, "invalid worker configuration");
            std::process::exit(1);
        }
    };

    echoboard_observability::init(&LogSettings {
        level: config.log_level.clone(),
        json: config.log_json,
    });

    if let Err(err) = run(config).await {
        tracing::error!(error = ?err, "worker exited with error");
        std::process::exit(1);
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let store = RedisJobStore::new(RedisSettings::new(config.redis.connection_url()))
        .context("failed to create redis job store")?;

    let collaborators = ServiceCollaborators {
        store: Arc::new(store),
        mailer: Arc::new(ResendMailer::new(config.resend_api_key.clone())),
        routines: Arc::new(LoggingMaintenance),
        audience: Arc::new(StaticReminderAudience::verified(
            config.mail.verified_email.clone(),
        )),
    };

    let service = QueueService::assemble(collaborators, &config)
        .await
        .context("failed to assemble queue service")?;
    service.start().await.context("failed to start queue service")?;

    service
        .schedule_recurring(
            Channel::Scheduled,
            MaintenanceTask::SendReminderEmails,
            &config.reminder_cron,
        )
        .await
        .context("failed to schedule reminder emails")?;

    tracing::info!(
        environment = %config.environment,
        email_concurrency = config.email_concurrency,
        scheduled_concurrency = config.scheduled_concurrency,
        "worker running"
    );

    shutdown_signal().await;
    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
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
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
