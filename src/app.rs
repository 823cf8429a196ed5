use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, PartitionVersion, RequestKey};
use crate::config::Config;
use crate::event::{Envelope, EventHandler, FetchRequest, HostEvent, NewMutation, Reply, ReplyBody};
use crate::interceptor::{FetchInterceptor, Interception};
use crate::lifecycle::LifecycleManager;
use crate::messages::{self, HostMessage};
use crate::notify;
use crate::queue::{MutationQueue, PendingMutation};
use crate::remote::{Network, RemoteApi, Request};
use crate::sync::{SyncCoordinator, SyncTag};

/// Application context: every handle the event handlers need, built once.
pub struct App<S: CacheStorage> {
  config: Config,
  origin: Url,
  network: Arc<dyn Network>,
  queue: Arc<dyn MutationQueue>,
  cache: CacheLayer<S>,
  lifecycle: LifecycleManager<S>,
  interceptor: FetchInterceptor<S>,
  sync: SyncCoordinator<S>,
  /// Detached cache writes that may still be running
  writes: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CacheStorage> App<S> {
  pub fn new(
    config: Config,
    storage: Arc<S>,
    queue: Arc<dyn MutationQueue>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    let version = PartitionVersion::new(&config.cache.prefix, &config.cache.version);

    let lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      origin.clone(),
      version,
      config.cache.static_assets.clone(),
      config.lifecycle.activate_immediately,
    );
    let cache = CacheLayer::following(Arc::clone(&storage), lifecycle.served());
    let interceptor = FetchInterceptor::new(
      cache.clone(),
      Arc::clone(&network),
      origin.clone(),
      config.cache.clone(),
    );
    let api = RemoteApi::new(Arc::clone(&network), origin.clone(), config.api.clone());
    let sync = SyncCoordinator::new(
      Arc::clone(&queue),
      api,
      cache.clone(),
      config.sync.refresh_resources.clone(),
    );

    let state = lifecycle.resume()?;
    info!(origin = %origin, %state, "offline layer ready");

    Ok(Self {
      config,
      origin,
      network,
      queue,
      cache,
      lifecycle,
      interceptor,
      sync,
      writes: Mutex::new(Vec::new()),
    })
  }

  #[cfg(test)]
  pub fn lifecycle(&self) -> &LifecycleManager<S> {
    &self.lifecycle
  }

  /// Handle one enveloped event, echoing its correlation id.
  pub async fn handle(&self, envelope: Envelope) -> Reply {
    Reply {
      id: envelope.id,
      body: self.dispatch(envelope.event).await,
    }
  }

  /// Route a host event to its component.
  ///
  /// Never fails: errors are logged and reported in the reply.
  pub async fn dispatch(&self, event: HostEvent) -> ReplyBody {
    match event {
      HostEvent::Install => match self.lifecycle.install().await {
        Ok(state) => ReplyBody::Lifecycle {
          state,
          deleted: Vec::new(),
        },
        Err(e) => ReplyBody::error(e),
      },
      HostEvent::Activate => match self.lifecycle.activate().await {
        Ok(deleted) => ReplyBody::Lifecycle {
          state: self.lifecycle.state(),
          deleted,
        },
        Err(e) => {
          warn!(error = %e, "activation failed");
          ReplyBody::error(e)
        }
      },
      HostEvent::Fetch { request } => self.fetch(request).await,
      HostEvent::Sync { tag } => match self.sync.on_sync(&tag).await {
        Ok(report) => ReplyBody::Sync {
          reports: report.into_iter().collect(),
        },
        Err(e) => {
          error!(%tag, error = %e, "background sync failed");
          ReplyBody::error(e)
        }
      },
      HostEvent::PeriodicSync { tag } => ReplyBody::Refresh {
        report: self.sync.on_periodic_sync(&tag).await,
      },
      HostEvent::Online => match self.sync.on_connectivity().await {
        Ok(reports) => ReplyBody::Sync { reports },
        Err(e) => {
          error!(error = %e, "connectivity sync failed");
          ReplyBody::error(e)
        }
      },
      HostEvent::Push { data } => {
        debug!("push notification received");
        ReplyBody::Notification {
          notification: notify::build_notification(&self.config.notifications, data.as_deref()),
        }
      }
      HostEvent::NotificationClick {
        action,
        url,
        clients,
      } => {
        let target = url.as_deref().unwrap_or(&self.config.notifications.url);
        ReplyBody::Click {
          outcome: notify::handle_click(action.as_deref(), target, &clients, &self.origin),
        }
      }
      HostEvent::Message { data } => self.message(&data).await,
      HostEvent::Enqueue { mutation } => self.enqueue(mutation),
    }
  }

  async fn fetch(&self, raw: FetchRequest) -> ReplyBody {
    let request = match self.build_request(raw) {
      Ok(request) => request,
      Err(e) => return ReplyBody::error(e),
    };

    if self.lifecycle.is_controlling() {
      if let Interception::Respond(intercepted) = self.interceptor.handle(&request).await {
        if let Some(write) = intercepted.persist {
          self.track_write(write);
        }
        let result = intercepted.result;
        return ReplyBody::response(result.data, Some(result.source), result.cached_at);
      }
    }

    // Not controlled or not intercepted: plain network
    match self.network.fetch(&request).await {
      Ok(response) => ReplyBody::response(response, None, None),
      Err(e) => ReplyBody::error(e),
    }
  }

  fn track_write(&self, write: JoinHandle<()>) {
    match self.writes.lock() {
      Ok(mut writes) => {
        writes.retain(|w| !w.is_finished());
        writes.push(write);
      }
      Err(e) => warn!(error = %e, "untracked cache write"),
    }
  }

  /// Wait for detached cache writes so they land before the process exits.
  pub async fn flush_writes(&self) {
    let pending = match self.writes.lock() {
      Ok(mut writes) => std::mem::take(&mut *writes),
      Err(e) => {
        warn!(error = %e, "cannot collect pending cache writes");
        return;
      }
    };
    for write in pending {
      if let Err(e) = write.await {
        error!(error = %e, "cache write task failed");
      }
    }
  }

  fn build_request(&self, raw: FetchRequest) -> Result<Request> {
    let method = Method::from_bytes(raw.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", raw.method, e))?;
    let url = self
      .origin
      .join(&raw.url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", raw.url, e))?;
    let body = raw.body_bytes()?;

    Ok(Request {
      method,
      url,
      navigation: raw.navigate,
      content_type: raw.content_type,
      body,
    })
  }

  async fn message(&self, data: &serde_json::Value) -> ReplyBody {
    let Some(message) = HostMessage::parse(data) else {
      return ReplyBody::Ack;
    };

    match message {
      HostMessage::SkipWaiting => match self.lifecycle.skip_waiting().await {
        Ok(state) => ReplyBody::Lifecycle {
          state,
          deleted: Vec::new(),
        },
        Err(e) => ReplyBody::error(e),
      },
      HostMessage::CacheTasks { tasks } => {
        let result = RequestKey::resolve(&self.origin, &self.config.api.tasks_endpoint)
          .and_then(|key| messages::cache_task_list(&self.cache, &key, &tasks));
        match result {
          Ok(()) => ReplyBody::Ack,
          Err(e) => {
            error!(error = %e, "failed to cache tasks");
            ReplyBody::error(e)
          }
        }
      }
      HostMessage::RegisterSync => match self.sync.registry().register(SyncTag::Tasks) {
        Ok(()) => {
          info!(tag = SyncTag::Tasks.as_str(), "background sync registered");
          ReplyBody::Ack
        }
        Err(e) => ReplyBody::error(e),
      },
    }
  }

  fn enqueue(&self, mutation: NewMutation) -> ReplyBody {
    let pending = PendingMutation::new(mutation.id, mutation.kind, mutation.payload);
    match self.queue.append(&pending) {
      Ok(()) => {
        info!(id = %pending.id, kind = pending.kind.as_str(), "mutation queued for sync");
        ReplyBody::Ack
      }
      Err(e) => {
        error!(id = %pending.id, error = %e, "failed to queue mutation");
        ReplyBody::error(e)
      }
    }
  }

  /// Serve host events from stdin until the stream closes.
  ///
  /// Every event runs in its own task; replies are written as they finish,
  /// so their order on stdout may differ from the input order.
  pub async fn run(self: Arc<Self>, mut events: EventHandler) -> Result<()> {
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    let writer = tokio::spawn(async move {
      let mut stdout = tokio::io::stdout();
      while let Some(reply) = reply_rx.recv().await {
        match serde_json::to_string(&reply) {
          Ok(line) => {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
          }
          Err(e) => error!(error = %e, "failed to encode reply"),
        }
      }
      Ok::<_, std::io::Error>(())
    });

    let mut tasks = JoinSet::new();
    while let Some(envelope) = events.next().await {
      let app = Arc::clone(&self);
      let tx = reply_tx.clone();
      tasks.spawn(async move {
        deliver(&tx, app.handle(envelope).await);
      });
    }

    while let Some(joined) = tasks.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "event task panicked");
      }
    }

    self.flush_writes().await;
    drop(reply_tx);
    writer.await??;
    Ok(())
  }
}

/// Hand a reply to the stdout writer. Returns false when the writer is gone.
fn deliver(tx: &mpsc::UnboundedSender<Reply>, reply: Reply) -> bool {
  match tx.send(reply) {
    Ok(()) => true,
    Err(e) => {
      warn!(id = ?e.0.id, "reply writer is gone, dropping reply");
      false
    }
  }
}
