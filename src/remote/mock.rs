//! Scripted in-process network for tests.

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Mutex;
use url::Url;

use super::client::{Network, NetworkError};
use super::types::{Request, Response};

pub const ORIGIN: &str = "http://localhost:8080";

pub fn origin() -> Url {
  Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
  origin().join(path).unwrap()
}

type Route = Box<dyn Fn(&Request) -> Option<Result<Response, NetworkError>> + Send + Sync>;

/// A request the network saw
#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: Method,
  pub url: String,
  pub body: Option<Vec<u8>>,
}

/// Network double. Unrouted requests fail as if offline.
pub struct ScriptedNetwork {
  routes: Mutex<Vec<Route>>,
  calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedNetwork {
  pub fn offline() -> Self {
    Self {
      routes: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn route<F>(&self, f: F)
  where
    F: Fn(&Request) -> Option<Result<Response, NetworkError>> + Send + Sync + 'static,
  {
    self.routes.lock().unwrap().push(Box::new(f));
  }

  pub fn respond(&self, method: Method, path: &str, response: Response) {
    let target = url(path).to_string();
    self.route(move |req| {
      (req.method == method && req.url.as_str() == target).then(|| Ok(response.clone()))
    });
  }

  pub fn fail(&self, method: Method, path: &str) {
    let target = url(path).to_string();
    self.route(move |req| {
      (req.method == method && req.url.as_str() == target)
        .then(|| Err(NetworkError::Connect("scripted failure".to_string())))
    });
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, method: Method, path: &str) -> Vec<RecordedCall> {
    let target = url(path).to_string();
    self
      .calls()
      .into_iter()
      .filter(|c| c.method == method && c.url == target)
      .collect()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method.clone(),
      url: request.url.to_string(),
      body: request.body.clone(),
    });

    let routes = self.routes.lock().unwrap();
    routes
      .iter()
      .find_map(|route| route(request))
      .unwrap_or_else(|| Err(NetworkError::Connect("offline".to_string())))
  }
}
