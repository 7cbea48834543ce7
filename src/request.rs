//! Request and response types shared by the matcher, strategies, and queue.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether this method mutates server state and is therefore a candidate
  /// for the retry queue rather than the cache.
  pub fn is_mutating(&self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Patch | Method::Delete)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// What kind of resource a request is for, as reported by the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// Full-page navigation
  Document,
  Script,
  Style,
  Image,
  /// API call or other fetch
  #[default]
  Data,
}

/// Normalized (method, URL) pair identifying a request for cache purposes.
///
/// The fragment is dropped during normalization; query strings are kept
/// because they distinguish API responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl RequestDescriptor {
  pub fn new(method: Method, url: &str, destination: Destination) -> Result<Self> {
    let mut url = Url::parse(url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
    url.set_fragment(None);

    Ok(Self {
      method,
      url,
      destination,
    })
  }

  /// Convenience constructor for a plain GET fetch.
  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::Get, url, Destination::Data)
  }

  /// Only GET requests may be written to a cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::Get
  }

  pub fn host(&self) -> &str {
    self.url.host_str().unwrap_or("")
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Stable fixed-length storage key for this descriptor.
  pub fn storage_key(&self) -> String {
    let input = format!("{} {}", self.method.as_str(), self.url);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A request in wire-serializable form, as stored in the retry queue and
/// handed to the network client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRequest {
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
}

/// An intercepted request: the normalized descriptor plus everything needed
/// to re-issue it over the network.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
  pub descriptor: RequestDescriptor,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl InterceptedRequest {
  pub fn new(descriptor: RequestDescriptor) -> Self {
    Self {
      descriptor,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn to_serialized(&self) -> SerializedRequest {
    SerializedRequest {
      method: self.descriptor.method,
      url: self.descriptor.url.to_string(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// An HTTP response in storable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
  pub status: u16,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl ResponsePayload {
  /// Whether a strategy is allowed to store this response.
  pub fn is_cacheable_success(&self) -> bool {
    self.status == 200
  }
}
