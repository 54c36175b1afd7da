//! SNS topics fanning out into SQS queues.

use crate::address::{QueueAddressResolver, QueueUrlCache, SqsInfo};
use aws_sdk_sns::error::DisplayErrorContext as SnsErrorContext;
use aws_sdk_sqs::error::DisplayErrorContext as SqsErrorContext;
use aws_sdk_sqs::types::QueueAttributeName;
use dashmap::DashMap;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::settings::EventBusSettings;
use eshop_eventbus_core::transport::{Delivery, Transport, TransportMessage, one_way_error};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// SQS caps a receive batch at 10 messages.
const MAX_BATCH: i32 = 10;
/// SQS caps long polling at 20 seconds.
const MAX_WAIT_SECONDS: i32 = 20;

/// Body of every SNS/SQS message.
///
/// SQS allows only ten message attributes, so headers travel inside the body
/// next to the payload.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    headers: BTreeMap<String, String>,
    body: String,
}

impl WireMessage {
    fn encode(message: &TransportMessage) -> Result<String, EventBusError> {
        let body = String::from_utf8(message.body.clone())
            .map_err(|e| EventBusError::Serialization(format!("message body is not UTF-8: {e}")))?;
        serde_json::to_string(&Self {
            headers: message.headers.clone(),
            body,
        })
        .map_err(|e| EventBusError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> Result<TransportMessage, EventBusError> {
        let wire: Self = serde_json::from_str(raw)
            .map_err(|e| EventBusError::Deserialization(format!("malformed SQS message: {e}")))?;
        Ok(TransportMessage::new(wire.headers, wire.body.into_bytes()))
    }
}

/// Resolves queue names through `GetQueueUrl`.
#[derive(Clone, Debug)]
pub struct SqsAddressResolver {
    client: aws_sdk_sqs::Client,
}

impl SqsAddressResolver {
    /// Resolver using `client`.
    #[must_use]
    pub const fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

impl QueueAddressResolver for SqsAddressResolver {
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, EventBusError>> {
        Box::pin(async move {
            let output = self
                .client
                .get_queue_url()
                .queue_name(address)
                .send()
                .await
                .map_err(|e| {
                    let missing = e
                        .as_service_error()
                        .is_some_and(aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError::is_queue_does_not_exist);
                    if missing {
                        EventBusError::AddressNotFound {
                            address: address.to_string(),
                            reason: "queue does not exist".to_string(),
                        }
                    } else {
                        EventBusError::transport(address, SqsErrorContext(&e))
                    }
                })?;

            output
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| EventBusError::AddressNotFound {
                    address: address.to_string(),
                    reason: "GetQueueUrl returned no URL".to_string(),
                })
        })
    }
}

struct InputQueue {
    name: String,
    info: SqsInfo,
}

/// SNS/SQS transport.
///
/// Topics are created on first use and their ARNs cached. Each endpoint owns
/// one input queue that is subscribed to every topic it handles with raw
/// message delivery.
pub struct SnsSqsTransport {
    sns: aws_sdk_sns::Client,
    sqs: aws_sdk_sqs::Client,
    queues: QueueUrlCache,
    topics: DashMap<String, String>,
    input: Option<InputQueue>,
    max_messages: i32,
    wait_time: Duration,
    buffered: Mutex<VecDeque<Delivery>>,
}

impl std::fmt::Debug for SnsSqsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnsSqsTransport")
            .field("input_queue", &self.input.as_ref().map(|q| &q.info.url))
            .field("topics", &self.topics.len())
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl SnsSqsTransport {
    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> SnsSqsTransportBuilder {
        SnsSqsTransportBuilder::default()
    }

    /// Load the AWS configuration (region and endpoint override from
    /// `settings.aws`) and build the transport for `settings`' input queue.
    ///
    /// # Errors
    ///
    /// See [`SnsSqsTransportBuilder::build`].
    pub async fn from_settings(settings: &EventBusSettings) -> Result<Self, EventBusError> {
        let mut loader = aws_config::from_env();
        if let Some(region) = settings.aws.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(url) = settings.aws.service_url.as_deref() {
            loader = loader.endpoint_url(url);
        }
        let config = loader.load().await;

        let mut builder = Self::builder().sdk_config(&config);
        if let Some(queue) = settings.input_queue() {
            builder = builder.input_queue(queue);
        }
        builder.build().await
    }

    /// The queue URL cache.
    #[must_use]
    pub const fn queue_urls(&self) -> &QueueUrlCache {
        &self.queues
    }

    fn require_input(&self, operation: &str) -> Result<&InputQueue, EventBusError> {
        self.input.as_ref().ok_or_else(|| one_way_error(operation))
    }

    async fn topic_arn(&self, topic: &str) -> Result<String, EventBusError> {
        if let Some(arn) = self.topics.get(topic) {
            return Ok(arn.clone());
        }

        // CreateTopic is idempotent and returns the existing ARN
        let output = self
            .sns
            .create_topic()
            .name(topic)
            .send()
            .await
            .map_err(|e| EventBusError::transport(topic, SnsErrorContext(&e)))?;
        let arn = output
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| EventBusError::transport(topic, "CreateTopic returned no ARN"))?;

        tracing::debug!(topic, arn = %arn, "Resolved topic");
        self.topics.insert(topic.to_string(), arn.clone());
        Ok(arn)
    }

    async fn create_queue(sqs: &aws_sdk_sqs::Client, queue: &str) -> Result<String, EventBusError> {
        let output = sqs
            .create_queue()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| EventBusError::transport(queue, SqsErrorContext(&e)))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| EventBusError::transport(queue, "CreateQueue returned no URL"))
    }

    /// Allow SNS topics of the input queue's account to deliver into it.
    async fn allow_topics(&self, input: &InputQueue) -> Result<(), EventBusError> {
        let info = &input.info;
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "AllowSnsTopics",
                "Effect": "Allow",
                "Principal": { "Service": "sns.amazonaws.com" },
                "Action": "sqs:SendMessage",
                "Resource": info.arn,
                "Condition": {
                    "ArnLike": { "aws:SourceArn": format!("arn:aws:sns:{}:{}:*", info.region, info.account_id) }
                }
            }]
        });

        self.sqs
            .set_queue_attributes()
            .queue_url(&info.url)
            .attributes(QueueAttributeName::Policy, policy.to_string())
            .send()
            .await
            .map_err(|e| EventBusError::transport(&input.name, SqsErrorContext(&e)))?;
        Ok(())
    }

    async fn subscription_arn(&self, topic_arn: &str, queue_arn: &str) -> Result<Option<String>, EventBusError> {
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .sns
                .list_subscriptions_by_topic()
                .topic_arn(topic_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| EventBusError::transport(topic_arn, SnsErrorContext(&e)))?;

            let found = page
                .subscriptions()
                .iter()
                .find(|s| s.endpoint() == Some(queue_arn))
                .and_then(|s| s.subscription_arn().map(str::to_string));
            if found.is_some() {
                return Ok(found);
            }

            match page.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }

    async fn fetch_batch(&self, input: &InputQueue) -> Result<VecDeque<Delivery>, EventBusError> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(&input.info.url)
            .max_number_of_messages(self.max_messages)
            .wait_time_seconds(i32::try_from(self.wait_time.as_secs()).unwrap_or(MAX_WAIT_SECONDS))
            .send()
            .await
            .map_err(|e| EventBusError::transport(&input.name, SqsErrorContext(&e)))?;

        let mut batch = VecDeque::new();
        for received in output.messages() {
            let Some(receipt) = received.receipt_handle() else {
                continue;
            };
            let message = match received.body().map(WireMessage::decode) {
                Some(Ok(message)) => message,
                // Undecodable bodies go to the dispatcher as-is; it dead-letters them
                Some(Err(_)) | None => TransportMessage::new(
                    BTreeMap::new(),
                    received.body().unwrap_or_default().as_bytes().to_vec(),
                ),
            };
            batch.push_back(Delivery {
                message,
                receipt: receipt.to_string(),
                queue: input.name.clone(),
            });
        }

        if !batch.is_empty() {
            tracing::debug!(queue = %input.name, received = batch.len(), "Received SQS batch");
        }
        Ok(batch)
    }
}

/// Builder for configuring an [`SnsSqsTransport`].
#[derive(Default)]
pub struct SnsSqsTransportBuilder {
    sns: Option<aws_sdk_sns::Client>,
    sqs: Option<aws_sdk_sqs::Client>,
    resolver: Option<Arc<dyn QueueAddressResolver>>,
    input_queue: Option<String>,
    fallback_region: Option<String>,
    max_messages: Option<i32>,
    wait_time: Option<Duration>,
}

impl SnsSqsTransportBuilder {
    /// Build both clients from a loaded SDK configuration.
    #[must_use]
    pub fn sdk_config(mut self, config: &aws_config::SdkConfig) -> Self {
        self.sns = Some(aws_sdk_sns::Client::new(config));
        self.sqs = Some(aws_sdk_sqs::Client::new(config));
        if self.fallback_region.is_none() {
            self.fallback_region = config.region().map(ToString::to_string);
        }
        self
    }

    /// Use explicit clients.
    #[must_use]
    pub fn clients(mut self, sns: aws_sdk_sns::Client, sqs: aws_sdk_sqs::Client) -> Self {
        self.sns = Some(sns);
        self.sqs = Some(sqs);
        self
    }

    /// Resolve queue names with `resolver` instead of `GetQueueUrl`.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn QueueAddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the input queue. Without one the transport is publish-only.
    #[must_use]
    pub fn input_queue(mut self, queue: impl Into<String>) -> Self {
        self.input_queue = Some(queue.into());
        self
    }

    /// Region for queue URLs that do not carry one (LocalStack).
    #[must_use]
    pub fn fallback_region(mut self, region: impl Into<String>) -> Self {
        self.fallback_region = Some(region.into());
        self
    }

    /// Messages fetched per receive call, clamped to 1..=10.
    ///
    /// Default: 10
    #[must_use]
    pub fn max_messages(mut self, max: i32) -> Self {
        self.max_messages = Some(max.clamp(1, MAX_BATCH));
        self
    }

    /// Long-poll wait per receive call, capped at 20 seconds.
    ///
    /// Default: 20 seconds
    #[must_use]
    pub fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait.min(Duration::from_secs(20)));
        self
    }

    /// Create the input queue (if any) and build the transport.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::Configuration`] if no clients were configured
    /// - [`EventBusError::Transport`] if the input queue cannot be created
    /// - [`EventBusError::AddressNotFound`] if its URL cannot be parsed
    pub async fn build(self) -> Result<SnsSqsTransport, EventBusError> {
        let (Some(sns), Some(sqs)) = (self.sns, self.sqs) else {
            return Err(EventBusError::Configuration(
                "AWS clients not configured".to_string(),
            ));
        };

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SqsAddressResolver::new(sqs.clone())));
        let queues = QueueUrlCache::new(resolver);

        let input = match self.input_queue {
            Some(name) => {
                let url = SnsSqsTransport::create_queue(&sqs, &name).await?;
                queues.insert(&name, url.clone());
                let info = SqsInfo::from_url(&url, self.fallback_region.as_deref())?;
                Some(InputQueue { name, info })
            },
            None => None,
        };

        let transport = SnsSqsTransport {
            sns,
            sqs,
            queues,
            topics: DashMap::new(),
            input,
            max_messages: self.max_messages.unwrap_or(MAX_BATCH),
            wait_time: self
                .wait_time
                .unwrap_or(Duration::from_secs(20)),
            buffered: Mutex::new(VecDeque::new()),
        };

        if let Some(input) = &transport.input {
            transport.allow_topics(input).await?;
        }

        tracing::info!(
            input_queue = transport.input.as_ref().map_or("<one-way>", |q| q.info.url.as_str()),
            "SnsSqsTransport created successfully"
        );
        Ok(transport)
    }
}

impl Transport for SnsSqsTransport {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let arn = self.topic_arn(topic).await?;
            let body = WireMessage::encode(message)?;
            self.sns
                .publish()
                .topic_arn(&arn)
                .message(body)
                .send()
                .await
                .map_err(|e| EventBusError::transport(topic, SnsErrorContext(&e)))?;
            tracing::debug!(
                topic,
                message_id = message.message_id().unwrap_or_default(),
                "Message published to SNS"
            );
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        queue: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let url = self.queues.resolve(queue).await?;
            let body = WireMessage::encode(message)?;
            self.sqs
                .send_message()
                .queue_url(url)
                .message_body(body)
                .send()
                .await
                .map_err(|e| EventBusError::transport(queue, SqsErrorContext(&e)))?;
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let input = self.require_input("subscribe")?;
            let topic_arn = self.topic_arn(topic).await?;

            // Subscribe is idempotent for identical attributes
            self.sns
                .subscribe()
                .topic_arn(&topic_arn)
                .protocol("sqs")
                .endpoint(&input.info.arn)
                .attributes("RawMessageDelivery", "true")
                .return_subscription_arn(true)
                .send()
                .await
                .map_err(|e| EventBusError::transport(topic, SnsErrorContext(&e)))?;

            tracing::info!(topic, queue = %input.name, "Subscribed to topic");
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let input = self.require_input("unsubscribe")?;
            let topic_arn = self.topic_arn(topic).await?;

            let Some(subscription) = self.subscription_arn(&topic_arn, &input.info.arn).await? else {
                tracing::debug!(topic, queue = %input.name, "No subscription to remove");
                return Ok(());
            };
            self.sns
                .unsubscribe()
                .subscription_arn(subscription)
                .send()
                .await
                .map_err(|e| EventBusError::transport(topic, SnsErrorContext(&e)))?;

            tracing::info!(topic, queue = %input.name, "Unsubscribed from topic");
            Ok(())
        })
    }

    fn ensure_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let url = Self::create_queue(&self.sqs, queue).await?;
            self.queues.insert(queue, url);
            Ok(())
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<Delivery>, EventBusError>> {
        Box::pin(async move {
            let input = self.require_input("receive")?;
            let mut buffered = self.buffered.lock().await;
            if buffered.is_empty() {
                *buffered = self.fetch_batch(input).await?;
            }
            Ok(buffered.pop_front())
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let input = self.require_input("ack")?;
            self.sqs
                .delete_message()
                .queue_url(&input.info.url)
                .receipt_handle(&delivery.receipt)
                .send()
                .await
                .map_err(|e| EventBusError::transport(&delivery.queue, SqsErrorContext(&e)))?;
            Ok(())
        })
    }

    fn release<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let input = self.require_input("release")?;
            self.sqs
                .change_message_visibility()
                .queue_url(&input.info.url)
                .receipt_handle(&delivery.receipt)
                .visibility_timeout(0)
                .send()
                .await
                .map_err(|e| EventBusError::transport(&delivery.queue, SqsErrorContext(&e)))?;
            Ok(())
        })
    }

    fn input_queue(&self) -> Option<&str> {
        self.input.as_ref().map(|q| q.name.as_str())
    }

    fn name(&self) -> &'static str {
        "sns-sqs"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use eshop_eventbus_core::transport::headers;

    #[test]
    fn wire_message_carries_headers_in_the_body() {
        let message = TransportMessage::new(BTreeMap::new(), br#"{"id":"1"}"#.to_vec())
            .with_header(headers::MESSAGE_ID, "1")
            .with_header(headers::SOURCE_ENDPOINT, "Ordering");

        let raw = WireMessage::encode(&message).expect("encode");
        let decoded = WireMessage::decode(&raw).expect("decode");

        assert_eq!(decoded, message);
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["headers"]["source-endpoint"], "Ordering");
    }

    #[test]
    fn non_utf8_body_cannot_be_encoded() {
        let message = TransportMessage::new(BTreeMap::new(), vec![0xff, 0xfe]);
        let err = WireMessage::encode(&message).expect_err("binary body");
        assert!(matches!(err, EventBusError::Serialization(_)));
    }

    #[test]
    fn malformed_body_is_a_deserialization_error() {
        let err = WireMessage::decode("plain text").expect_err("not json");
        assert!(err.is_poison());
    }

    #[tokio::test]
    async fn builder_requires_clients() {
        let err = SnsSqsTransport::builder()
            .input_queue("Ordering")
            .build()
            .await
            .expect_err("no clients");
        assert!(err.is_configuration());
    }

    #[test]
    fn sns_sqs_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SnsSqsTransport>();
        assert_sync::<SnsSqsTransport>();
    }
}
