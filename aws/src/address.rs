//! Queue address resolution.
//!
//! SQS operations need queue URLs, while endpoints and the `Error`/`Audit`
//! queues are configured by name. [`QueueUrlCache`] resolves each symbolic
//! address once per process: keys are lowercased, absolute URLs are returned
//! unchanged, and concurrent first lookups of the same address share a single
//! outbound call.

use dashmap::DashMap;
use eshop_eventbus_core::EventBusError;
use futures::future::BoxFuture;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::sync::OnceCell;

/// Account id LocalStack reports for every queue.
pub const LOCALSTACK_ACCOUNT: &str = "000000000000";

static SQS_URL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(?:sqs\.(?P<region>[a-z0-9-]+)\.amazonaws\.com|[^/:]+(?::\d+)?)/(?P<account>\d+)/(?P<name>[^/?#]+)/?$",
    )
});

/// Backend lookup of a queue URL by name.
pub trait QueueAddressResolver: Send + Sync {
    /// URL of the queue called `address`.
    ///
    /// Fails with [`EventBusError::AddressNotFound`] when no such queue exists.
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, EventBusError>>;
}

/// Process-wide, lazily populated queue URL cache.
pub struct QueueUrlCache {
    resolver: Arc<dyn QueueAddressResolver>,
    entries: DashMap<String, Arc<OnceCell<String>>>,
}

impl std::fmt::Debug for QueueUrlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueUrlCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl QueueUrlCache {
    /// Empty cache in front of `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<dyn QueueAddressResolver>) -> Self {
        Self {
            resolver,
            entries: DashMap::new(),
        }
    }

    /// URL for `address`, resolving it on first use.
    ///
    /// Failed lookups are not cached, so a queue created later resolves on
    /// the next call.
    ///
    /// # Errors
    ///
    /// Whatever the resolver returns: [`EventBusError::AddressNotFound`] for
    /// unknown queues, [`EventBusError::Transport`] for backend failures.
    pub async fn resolve(&self, address: &str) -> Result<String, EventBusError> {
        if is_absolute_url(address) {
            return Ok(address.to_string());
        }

        let cell = self
            .entries
            .entry(address.to_lowercase())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let url = cell
            .get_or_try_init(|| async {
                let url = self.resolver.resolve(address).await?;
                tracing::debug!(address, url = %url, "Resolved queue address");
                Ok::<_, EventBusError>(url)
            })
            .await?;
        Ok(url.clone())
    }

    /// Record a URL learned some other way (for example from `CreateQueue`).
    pub fn insert(&self, address: &str, url: impl Into<String>) {
        let cell = OnceCell::new_with(Some(url.into()));
        self.entries.insert(address.to_lowercase(), Arc::new(cell));
    }

    /// Forget `address`, e.g. after the queue was deleted.
    pub fn invalidate(&self, address: &str) {
        self.entries.remove(&address.to_lowercase());
    }

    /// Number of cached addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_absolute_url(address: &str) -> bool {
    address.starts_with("https://") || address.starts_with("http://")
}

/// Components of an SQS queue URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsInfo {
    /// The URL it was parsed from
    pub url: String,
    /// Region, from the host or the configured fallback
    pub region: String,
    /// Owning account
    pub account_id: String,
    /// Queue name
    pub name: String,
    /// `arn:aws:sqs:<region>:<account>:<name>`
    pub arn: String,
}

impl SqsInfo {
    /// Parse an SQS queue URL.
    ///
    /// Regional AWS hosts (`sqs.<region>.amazonaws.com`) carry the region.
    /// Other hosts (LocalStack) do not; for the LocalStack account the
    /// `fallback_region` is used.
    ///
    /// # Errors
    ///
    /// [`EventBusError::AddressNotFound`] if `url` is not a queue URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use eshop_eventbus_aws::SqsInfo;
    ///
    /// let info = SqsInfo::from_url(
    ///     "https://sqs.eu-west-1.amazonaws.com/123456789012/Ordering",
    ///     None,
    /// )
    /// .unwrap();
    /// assert_eq!(info.arn, "arn:aws:sqs:eu-west-1:123456789012:Ordering");
    /// ```
    pub fn from_url(url: &str, fallback_region: Option<&str>) -> Result<Self, EventBusError> {
        let not_a_queue = |reason: &str| EventBusError::AddressNotFound {
            address: url.to_string(),
            reason: reason.to_string(),
        };

        let pattern = SQS_URL
            .as_ref()
            .map_err(|e| EventBusError::Configuration(format!("invalid SQS URL pattern: {e}")))?;
        let captures = pattern
            .captures(url)
            .ok_or_else(|| not_a_queue("not an SQS queue URL"))?;

        let account_id = captures
            .name("account")
            .map_or_else(String::new, |m| m.as_str().to_string());
        let name = captures
            .name("name")
            .map_or_else(String::new, |m| m.as_str().to_string());
        let mut region = captures
            .name("region")
            .map_or_else(String::new, |m| m.as_str().to_string());

        if region.is_empty() && account_id == LOCALSTACK_ACCOUNT {
            region = fallback_region.unwrap_or_default().to_string();
        }

        let arn = format!("arn:aws:sqs:{region}:{account_id}:{name}");
        Ok(Self {
            url: url.to_string(),
            region,
            account_id,
            name,
            arn,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl QueueAddressResolver for CountingResolver {
        fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<String, EventBusError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                if address.eq_ignore_ascii_case("missing") {
                    return Err(EventBusError::AddressNotFound {
                        address: address.to_string(),
                        reason: "queue does not exist".to_string(),
                    });
                }
                Ok(format!(
                    "http://localhost:4566/000000000000/{}",
                    address.to_lowercase()
                ))
            })
        }
    }

    fn cache() -> (Arc<CountingResolver>, QueueUrlCache) {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let cache = QueueUrlCache::new(resolver.clone());
        (resolver, cache)
    }

    #[tokio::test]
    async fn concurrent_first_lookups_share_one_resolution() {
        let (resolver, cache) = cache();
        let cache = Arc::new(cache);

        let lookups = (0..16).map(|i| {
            let cache = Arc::clone(&cache);
            // Mixed casing maps to one key
            let address = if i % 2 == 0 { "Ordering" } else { "ordering" };
            tokio::spawn(async move { cache.resolve(address).await })
        });
        let urls = futures::future::join_all(lookups).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        for url in urls {
            assert_eq!(
                url.expect("task").expect("resolved"),
                "http://localhost:4566/000000000000/ordering"
            );
        }
    }

    #[tokio::test]
    async fn absolute_urls_skip_the_resolver() {
        let (resolver, cache) = cache();
        let url = "https://sqs.us-east-1.amazonaws.com/123456789012/Basket";

        assert_eq!(cache.resolve(url).await.expect("url"), url);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_lookup_is_retried_later() {
        let (resolver, cache) = cache();

        let err = cache.resolve("missing").await.expect_err("no queue");
        assert!(err.is_configuration());
        assert!(cache.resolve("missing").await.is_err());

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inserted_and_invalidated_entries() {
        let (resolver, cache) = cache();
        cache.insert("Error", "http://localhost:4566/000000000000/Error");

        assert_eq!(
            cache.resolve("error").await.expect("seeded"),
            "http://localhost:4566/000000000000/Error"
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);

        cache.invalidate("ERROR");
        cache.resolve("Error").await.expect("re-resolved");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parses_regional_queue_url() {
        let info = SqsInfo::from_url(
            "https://sqs.us-east-2.amazonaws.com/123456789012/Catalog",
            Some("eu-west-1"),
        )
        .expect("queue url");

        assert_eq!(info.region, "us-east-2");
        assert_eq!(info.account_id, "123456789012");
        assert_eq!(info.name, "Catalog");
        assert_eq!(info.arn, "arn:aws:sqs:us-east-2:123456789012:Catalog");
    }

    #[test]
    fn localstack_url_takes_the_configured_region() {
        let info = SqsInfo::from_url("http://localhost:4566/000000000000/Basket", Some("us-east-1"))
            .expect("queue url");

        assert_eq!(info.region, "us-east-1");
        assert_eq!(info.arn, "arn:aws:sqs:us-east-1:000000000000:Basket");
    }

    #[test]
    fn rejects_non_queue_urls() {
        let err = SqsInfo::from_url("https://example.com/not-a-queue", None).expect_err("invalid");
        assert!(matches!(err, EventBusError::AddressNotFound { .. }));
    }
}
