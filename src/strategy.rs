//! The four request-resolution strategies.
//!
//! Strategies take the network as an injected fetcher closure, the way the
//! cache layer is built: callers decide how a fetch is issued, strategies
//! decide how cache and network combine.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheStore, EvictionPolicy, StoredResponse};
use crate::net::HttpClient;
use crate::queue::RetryQueue;
use crate::request::{InterceptedRequest, RequestDescriptor, ResponsePayload};
use crate::rules::{Rule, StrategyKind};

/// NetworkFirst race timeout when the rule doesn't declare one.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 3;

/// Resolves requests against the cache store and the network, and hands
/// failed mutating requests to the retry queue.
pub struct StrategyEngine {
  store: Arc<dyn CacheStore>,
  queue: Arc<RetryQueue>,
}

impl StrategyEngine {
  pub fn new(store: Arc<dyn CacheStore>, queue: Arc<RetryQueue>) -> Self {
    Self { store, queue }
  }

  /// Dispatch a matched request to its rule's strategy.
  pub async fn handle(
    &self,
    rule: &Rule,
    request: &InterceptedRequest,
    net: &HttpClient,
  ) -> Result<ResponsePayload> {
    let fetch = {
      let net = net.clone();
      let serialized = request.to_serialized();
      move || async move { net.fetch(&serialized).await }
    };

    match rule.strategy {
      StrategyKind::CacheFirst => {
        self
          .cache_first(
            self.cache_name(rule)?,
            &request.descriptor,
            rule.eviction.as_ref(),
            fetch,
          )
          .await
      }
      StrategyKind::NetworkFirst => {
        let timeout =
          Duration::from_secs(rule.timeout_seconds.unwrap_or(DEFAULT_NETWORK_TIMEOUT_SECS));
        self
          .network_first(
            self.cache_name(rule)?,
            &request.descriptor,
            rule.eviction.as_ref(),
            timeout,
            fetch,
          )
          .await
      }
      StrategyKind::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(
            self.cache_name(rule)?,
            &request.descriptor,
            rule.eviction.as_ref(),
            fetch,
          )
          .await
      }
      StrategyKind::NetworkOnly => {
        self
          .network_only(rule.queue.as_deref(), request, fetch)
          .await
      }
    }
  }

  fn cache_name<'a>(&self, rule: &'a Rule) -> Result<&'a str> {
    rule
      .cache_name
      .as_deref()
      .ok_or_else(|| eyre!("Rule with {:?} strategy has no cache name", rule.strategy))
  }

  /// Serve from cache when present; otherwise fetch, store on success, and
  /// return. A present entry is never refreshed implicitly.
  pub async fn cache_first<F, Fut>(
    &self,
    cache_name: &str,
    request: &RequestDescriptor,
    policy: Option<&EvictionPolicy>,
    fetch: F,
  ) -> Result<ResponsePayload>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponsePayload>>,
  {
    let key = request.storage_key();

    if let Some(hit) = self.lookup(cache_name, &key) {
      return Ok(hit.response);
    }

    let response = fetch().await?;
    if request.is_cacheable() && response.is_cacheable_success() {
      self.store_response(cache_name, &key, &response, policy);
    }

    Ok(response)
  }

  /// Race the network against a timer. A network response wins outright;
  /// on timeout or fetch failure the cached entry is served instead. The
  /// timed-out fetch is left running so a late success can still update the
  /// cache for future requests.
  pub async fn network_first<F, Fut>(
    &self,
    cache_name: &str,
    request: &RequestDescriptor,
    policy: Option<&EvictionPolicy>,
    timeout: Duration,
    fetch: F,
  ) -> Result<ResponsePayload>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponsePayload>> + Send + 'static,
  {
    let key = request.storage_key();

    let mut task = {
      let store = Arc::clone(&self.store);
      let cache_name = cache_name.to_string();
      let key = key.clone();
      let policy = policy.copied();
      let cacheable = request.is_cacheable();
      let fut = fetch();

      tokio::spawn(async move {
        let response = fut.await?;
        if cacheable && response.is_cacheable_success() {
          if let Err(e) = store.put(&cache_name, &key, &response, policy.as_ref()) {
            warn!(cache = %cache_name, error = %e, "cache write failed");
          }
        }
        Ok::<_, color_eyre::Report>(response)
      })
    };

    match tokio::time::timeout(timeout, &mut task).await {
      Ok(Ok(Ok(response))) => Ok(response),
      Ok(Ok(Err(fetch_err))) => match self.lookup(cache_name, &key) {
        Some(hit) => Ok(hit.response),
        None => Err(fetch_err),
      },
      Ok(Err(join_err)) => Err(eyre!("Network fetch task failed: {}", join_err)),
      Err(_elapsed) => match self.lookup(cache_name, &key) {
        // The abandoned fetch may still complete and update the cache.
        Some(hit) => Ok(hit.response),
        None => Err(eyre!(
          "Network did not respond within {:?} and no cached entry exists",
          timeout
        )),
      },
    }
  }

  /// Serve the cached entry immediately and revalidate in the background;
  /// block on the network only for a cold cache.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    cache_name: &str,
    request: &RequestDescriptor,
    policy: Option<&EvictionPolicy>,
    fetch: F,
  ) -> Result<ResponsePayload>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponsePayload>> + Send + 'static,
  {
    let key = request.storage_key();
    let cacheable = request.is_cacheable();

    match self.lookup(cache_name, &key) {
      Some(hit) => {
        let store = Arc::clone(&self.store);
        let cache_name = cache_name.to_string();
        let policy = policy.copied();
        let fut = fetch();

        tokio::spawn(async move {
          match fut.await {
            Ok(response) if cacheable && response.is_cacheable_success() => {
              if let Err(e) = store.put(&cache_name, &key, &response, policy.as_ref()) {
                warn!(cache = %cache_name, error = %e, "cache write failed");
              }
            }
            Ok(response) => {
              debug!(cache = %cache_name, status = response.status, "revalidation not cacheable");
            }
            Err(e) => {
              debug!(cache = %cache_name, error = %e, "background revalidation failed");
            }
          }
        });

        Ok(hit.response)
      }
      None => {
        let response = fetch().await?;
        if cacheable && response.is_cacheable_success() {
          self.store_response(cache_name, &key, &response, policy);
        }
        Ok(response)
      }
    }
  }

  /// Never touch the cache. A mutating request that fails at the transport
  /// level is persisted to its rule's retry queue before the failure is
  /// surfaced.
  pub async fn network_only<F, Fut>(
    &self,
    queue_name: Option<&str>,
    request: &InterceptedRequest,
    fetch: F,
  ) -> Result<ResponsePayload>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResponsePayload>>,
  {
    match fetch().await {
      Ok(response) => Ok(response),
      Err(fetch_err) => {
        if let Some(queue_name) = queue_name {
          if request.descriptor.method.is_mutating() {
            self.queue.enqueue(queue_name, &request.to_serialized())?;
            warn!(
              queue = queue_name,
              url = %request.descriptor.url,
              "request queued for background replay"
            );
          }
        }
        Err(fetch_err)
      }
    }
  }

  /// Cache read with storage failures degraded to a miss.
  fn lookup(&self, cache_name: &str, key: &str) -> Option<StoredResponse> {
    match self.store.get(cache_name, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(cache = %cache_name, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Cache write with storage failures logged, never surfaced.
  fn store_response(
    &self,
    cache_name: &str,
    key: &str,
    response: &ResponsePayload,
    policy: Option<&EvictionPolicy>,
  ) {
    if let Err(e) = self.store.put(cache_name, key, response, policy) {
      warn!(cache = %cache_name, error = %e, "cache write failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::queue::QueueConfig;
  use crate::request::Method;

  fn engine() -> StrategyEngine {
    StrategyEngine::new(
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      Arc::new(RetryQueue::open_in_memory(QueueConfig::default()).unwrap()),
    )
  }

  fn resp(status: u16, body: &[u8]) -> ResponsePayload {
    ResponsePayload {
      status,
      headers: Vec::new(),
      body: body.to_vec(),
    }
  }

  fn descriptor(url: &str) -> RequestDescriptor {
    RequestDescriptor::get(url).unwrap()
  }

  async fn wait_for_body(engine: &StrategyEngine, cache: &str, key: &str, body: &[u8]) {
    for _ in 0..200 {
      if let Ok(Some(hit)) = engine.store.get(cache, key) {
        if hit.response.body == body {
          return;
        }
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cache never reached expected body");
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once_then_serves_cache() {
    let engine = engine();
    let request = descriptor("https://touchline.example/media/logo.png");

    let first = engine
      .cache_first("media", &request, None, || async { Ok(resp(200, b"logo")) })
      .await
      .unwrap();
    assert_eq!(first.body, b"logo");

    // No network available this time - must come from cache
    let second = engine
      .cache_first("media", &request, None, || async {
        Err(eyre!("network down"))
      })
      .await
      .unwrap();
    assert_eq!(second.body, b"logo");
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_failures() {
    let engine = engine();
    let request = descriptor("https://touchline.example/media/missing.png");

    let response = engine
      .cache_first("media", &request, None, || async { Ok(resp(404, b"nope")) })
      .await
      .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(engine.store.count("media").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_propagates_total_failure() {
    let engine = engine();
    let request = descriptor("https://touchline.example/media/x.png");

    let result = engine
      .cache_first("media", &request, None, || async {
        Err(eyre!("network down"))
      })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_first_serves_cache_when_network_is_slow() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/scores/42");
    let key = request.storage_key();

    engine.store.put("scores", &key, &resp(200, b"cached"), None).unwrap();

    let response = engine
      .network_first("scores", &request, None, Duration::from_secs(3), || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(resp(200, b"late"))
      })
      .await
      .unwrap();

    // Timer fired first: the cached value wins, not the late response
    assert_eq!(response.body, b"cached");

    // The abandoned fetch still lands in the cache for next time
    wait_for_body(&engine, "scores", &key, b"late").await;
  }

  #[tokio::test]
  async fn test_network_first_stores_and_returns_fast_response() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/scores/42");

    let response = engine
      .network_first("scores", &request, None, Duration::from_secs(3), || async {
        Ok(resp(200, b"fresh"))
      })
      .await
      .unwrap();

    assert_eq!(response.body, b"fresh");
    wait_for_body(&engine, "scores", &request.storage_key(), b"fresh").await;
  }

  #[tokio::test]
  async fn test_network_first_falls_back_on_fetch_failure() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/scores/42");
    let key = request.storage_key();

    engine.store.put("scores", &key, &resp(200, b"cached"), None).unwrap();

    let response = engine
      .network_first("scores", &request, None, Duration::from_secs(3), || async {
        Err(eyre!("connection refused"))
      })
      .await
      .unwrap();
    assert_eq!(response.body, b"cached");
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_first_propagates_failure_without_cache() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/scores/42");

    let result = engine
      .network_first("scores", &request, None, Duration::from_secs(3), || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(resp(200, b"late"))
      })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_swr_cold_cache_blocks_once() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/articles");

    let first = engine
      .stale_while_revalidate("articles", &request, None, || async {
        Ok(resp(200, b"v1"))
      })
      .await
      .unwrap();
    assert_eq!(first.body, b"v1");

    // Immediately after, the cached value is served without waiting
    let second = engine
      .stale_while_revalidate("articles", &request, None, || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(resp(200, b"v2"))
      })
      .await
      .unwrap();
    assert_eq!(second.body, b"v1");
  }

  #[tokio::test]
  async fn test_swr_revalidates_in_background() {
    let engine = engine();
    let request = descriptor("https://touchline.example/api/articles");
    let key = request.storage_key();

    engine.store.put("articles", &key, &resp(200, b"v1"), None).unwrap();

    let served = engine
      .stale_while_revalidate("articles", &request, None, || async {
        Ok(resp(200, b"v2"))
      })
      .await
      .unwrap();
    assert_eq!(served.body, b"v1");

    // The background fetch overwrites the entry for future requests
    wait_for_body(&engine, "articles", &key, b"v2").await;
  }

  #[tokio::test]
  async fn test_network_only_queues_failed_mutating_request() {
    let engine = engine();
    let request = InterceptedRequest {
      descriptor: RequestDescriptor::new(
        Method::Post,
        "https://touchline.example/api/contact",
        Default::default(),
      )
      .unwrap(),
      headers: Vec::new(),
      body: Some(b"name=sam".to_vec()),
    };

    let result = engine
      .network_only(Some("contact-form"), &request, || async {
        Err(eyre!("no connectivity"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(engine.queue.len("contact-form").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_network_only_does_not_queue_get_requests() {
    let engine = engine();
    let request = InterceptedRequest::new(descriptor("https://touchline.example/api/live"));

    let result = engine
      .network_only(Some("contact-form"), &request, || async {
        Err(eyre!("no connectivity"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(engine.queue.len("contact-form").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_network_only_success_is_not_queued() {
    let engine = engine();
    let request = InterceptedRequest {
      descriptor: RequestDescriptor::new(
        Method::Post,
        "https://touchline.example/api/contact",
        Default::default(),
      )
      .unwrap(),
      headers: Vec::new(),
      body: None,
    };

    let response = engine
      .network_only(Some("contact-form"), &request, || async {
        Ok(resp(201, b"created"))
      })
      .await
      .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(engine.queue.len("contact-form").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_network_only_never_touches_the_cache() {
    let engine = engine();
    let request = InterceptedRequest::new(descriptor("https://touchline.example/api/live"));

    engine
      .network_only(None, &request, || async { Ok(resp(200, b"live")) })
      .await
      .unwrap();

    assert!(engine.store.list_caches().unwrap().is_empty());
  }
}
