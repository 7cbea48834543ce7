//! Thin HTTP client used for strategy fetches, queue replay, and precaching.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::request::{Method, ResponsePayload, SerializedRequest};

/// Network client wrapper.
///
/// A transport-level error (no connectivity, DNS failure, connect timeout)
/// surfaces as `Err`; any HTTP response, success or not, is `Ok`. Strategies
/// and the retry queue rely on that distinction.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Issue a request and collect the full response body.
  pub async fn fetch(&self, request: &SerializedRequest) -> Result<ResponsePayload> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, &request.url);

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(ResponsePayload {
      status,
      headers,
      body,
    })
  }
}
