use reqwest::Method;
use url::Url;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// An outbound request as seen by the interceptor
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Top-level document navigation (as opposed to a subresource or XHR)
  pub navigation: bool,
  pub content_type: Option<String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      navigation: false,
      content_type: None,
      body: None,
    }
  }

  #[cfg(test)]
  pub fn navigate(url: Url) -> Self {
    Self {
      navigation: true,
      ..Self::get(url)
    }
  }

  pub fn post_json(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::POST,
      url,
      navigation: false,
      content_type: Some(CONTENT_TYPE_JSON.to_string()),
      body: Some(body),
    }
  }
}

/// A response, either from the network or rebuilt from a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body: body.into(),
    }
  }

  pub fn text(status: u16, body: &str) -> Self {
    Self::new(status, Some(CONTENT_TYPE_TEXT), body)
  }

  pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self::new(status, Some(CONTENT_TYPE_JSON), body)
  }

  /// Any 2xx status
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Exactly 200; only these are worth caching (no partials, no empties)
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }
}
