//! Fleet manager audit side channel.
//!
//! Audit records are queued on a bounded channel and posted by a dedicated
//! task, so a slow or unreachable fleet manager never delays message handling.
//! When the channel is full the record is dropped with a warning.

use crate::delivery::DeliveryState;
use chrono::{DateTime, Utc};
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::settings::FleetManagerSettings;
use eshop_eventbus_core::transport::TransportMessage;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Header carrying the fleet manager API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One handled message, as reported to the fleet manager.
///
/// Carries the full message: transport headers and the envelope body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Envelope id
    pub message_id: Uuid,
    /// Event type discriminator
    pub event_type: String,
    /// Endpoint that handled the message
    pub endpoint: String,
    /// Final state of this delivery
    pub outcome: String,
    /// 1-based delivery attempt
    pub attempt: u32,
    /// When handling finished
    pub handled_at: DateTime<Utc>,
    /// Handler error, if any
    pub error: Option<String>,
    /// Transport headers as received
    pub headers: BTreeMap<String, String>,
    /// Message body; JSON bodies are embedded as-is, anything else as a
    /// lossy UTF-8 string
    pub body: serde_json::Value,
}

impl AuditRecord {
    /// Build a record for a handled delivery.
    #[must_use]
    pub fn new(
        message_id: Uuid,
        event_type: impl Into<String>,
        endpoint: impl Into<String>,
        outcome: DeliveryState,
        attempt: u32,
        handled_at: DateTime<Utc>,
        error: Option<&EventBusError>,
    ) -> Self {
        Self {
            message_id,
            event_type: event_type.into(),
            endpoint: endpoint.into(),
            outcome: outcome.as_str().to_string(),
            attempt,
            handled_at,
            error: error.map(ToString::to_string),
            headers: BTreeMap::new(),
            body: serde_json::Value::Null,
        }
    }

    /// Attach the headers and body of the handled message.
    #[must_use]
    pub fn with_content(mut self, message: &TransportMessage) -> Self {
        self.headers.clone_from(&message.headers);
        self.body = serde_json::from_slice(&message.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.body).into_owned())
        });
        self
    }
}

/// Non-blocking producer side of the fleet audit channel.
#[derive(Debug, Clone)]
pub struct FleetAuditor {
    sender: mpsc::Sender<AuditRecord>,
}

impl FleetAuditor {
    /// Spawn the posting task for `settings`.
    ///
    /// The task ends once every `FleetAuditor` clone is dropped and the queue
    /// is drained.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Configuration`] if the fleet manager URL or API key is
    /// missing, or the HTTP client cannot be built.
    pub fn spawn(
        settings: &FleetManagerSettings,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), EventBusError> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| EventBusError::Configuration("fleet manager URL is required".into()))?;
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| EventBusError::Configuration("fleet manager API key is required".into()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| EventBusError::Configuration(format!("fleet manager client: {e}")))?;

        let (sender, mut receiver) = mpsc::channel::<AuditRecord>(capacity.max(1));

        let handle = tokio::spawn(async move {
            tracing::info!(url = %url, "Fleet audit channel started");
            while let Some(record) = receiver.recv().await {
                post(&client, &url, &api_key, &record).await;
            }
            tracing::info!("Fleet audit channel stopped");
        });

        Ok((Self { sender }, handle))
    }

    /// Auditor feeding an arbitrary channel.
    #[must_use]
    pub const fn from_sender(sender: mpsc::Sender<AuditRecord>) -> Self {
        Self { sender }
    }

    /// Queue a record without waiting.
    ///
    /// Returns `false` if the record was dropped.
    pub fn submit(&self, record: AuditRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                tracing::warn!(
                    message_id = %record.message_id,
                    "Fleet audit queue is full, dropping record"
                );
                metrics::counter!("eventbus.fleet.dropped").increment(1);
                false
            }
            Err(TrySendError::Closed(record)) => {
                tracing::warn!(
                    message_id = %record.message_id,
                    "Fleet audit channel is closed, dropping record"
                );
                false
            }
        }
    }
}

async fn post(client: &reqwest::Client, url: &str, api_key: &str, record: &AuditRecord) {
    let result = client
        .post(url)
        .header(API_KEY_HEADER, api_key)
        .json(record)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(message_id = %record.message_id, "Audit record posted");
        }
        Ok(response) => {
            tracing::warn!(
                message_id = %record.message_id,
                status = %response.status(),
                "Fleet manager rejected audit record"
            );
        }
        Err(err) => {
            tracing::warn!(
                message_id = %record.message_id,
                error = %err,
                "Could not post audit record"
            );
        }
    }
}
