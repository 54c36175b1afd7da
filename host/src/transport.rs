//! Backend selection.

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::settings::{EventBusSettings, TransportKind};
use eshop_eventbus_core::transport::Transport;
use std::sync::Arc;

/// Build the transport `settings` ask for.
///
/// Chosen once at startup: RabbitMQ when `rabbitmq_enabled`, SNS/SQS
/// otherwise.
///
/// # Errors
///
/// - [`EventBusError::Configuration`] if the settings are invalid or the
///   selected backend was not compiled in
/// - the backend's connection errors
pub async fn build_transport(settings: &EventBusSettings) -> Result<Arc<dyn Transport>, EventBusError> {
    settings.validate()?;
    let kind = settings.transport_kind();
    tracing::info!(
        transport = ?kind,
        endpoint = settings.input_queue().unwrap_or("<one-way>"),
        "Building event bus transport"
    );

    match kind {
        TransportKind::RabbitMq => rabbitmq(settings).await,
        TransportKind::AmazonSnsSqs => sns_sqs(settings).await,
    }
}

#[cfg(feature = "rabbitmq")]
async fn rabbitmq(settings: &EventBusSettings) -> Result<Arc<dyn Transport>, EventBusError> {
    let transport = eshop_eventbus_rabbitmq::RabbitMqTransport::from_settings(settings).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "rabbitmq"))]
async fn rabbitmq(_settings: &EventBusSettings) -> Result<Arc<dyn Transport>, EventBusError> {
    Err(not_compiled_in("rabbitmq"))
}

#[cfg(feature = "aws")]
async fn sns_sqs(settings: &EventBusSettings) -> Result<Arc<dyn Transport>, EventBusError> {
    let transport = eshop_eventbus_aws::SnsSqsTransport::from_settings(settings).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "aws"))]
async fn sns_sqs(_settings: &EventBusSettings) -> Result<Arc<dyn Transport>, EventBusError> {
    Err(not_compiled_in("aws"))
}

#[cfg(any(not(feature = "rabbitmq"), not(feature = "aws")))]
fn not_compiled_in(feature: &str) -> EventBusError {
    EventBusError::Configuration(format!(
        "transport backend '{feature}' is not enabled in this build"
    ))
}
