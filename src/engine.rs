//! The engine actor: one inbox, four external event kinds.
//!
//! The browser's single-global-worker model is re-expressed here as an
//! actor owning the rule table, strategy engine, and retry queue. Events
//! arrive over an mpsc inbox; request and sync handlers are spawned so
//! different event kinds can overlap, while activation always completes
//! before the first request is served.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, ClientEvent};
use crate::cache::{generation, CacheStore};
use crate::config::Config;
use crate::net::HttpClient;
use crate::notify::{DisplayedNotification, HostSink, NotificationDispatcher};
use crate::queue::{DrainOutcome, RetryQueue};
use crate::request::{Destination, InterceptedRequest, Method, RequestDescriptor, ResponsePayload};
use crate::rules::RuleSet;
use crate::strategy::StrategyEngine;

/// What prompted a queue replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
  ConnectivityRestored,
  Periodic,
}

/// Events the engine reacts to.
enum EngineEvent {
  /// An outbound request intercepted from the hosting application
  Fetch {
    request: InterceptedRequest,
    reply: oneshot::Sender<Result<ResponsePayload>>,
  },
  /// A queue replay trigger
  Sync { reason: SyncReason },
  /// A push delivery with an opaque payload
  Push { payload: Vec<u8> },
  /// The user clicked a displayed notification
  NotificationClick {
    notification: DisplayedNotification,
  },
}

/// Cloneable handle the hosting application talks to the engine through.
#[derive(Clone)]
pub struct EngineHandle {
  tx: mpsc::UnboundedSender<EngineEvent>,
  broadcaster: Broadcaster,
}

impl EngineHandle {
  /// Intercept an outbound request and resolve it through the rule table.
  pub async fn intercept(&self, request: InterceptedRequest) -> Result<ResponsePayload> {
    let (reply, rx) = oneshot::channel();

    self
      .tx
      .send(EngineEvent::Fetch { request, reply })
      .map_err(|_| eyre!("Engine is not running"))?;

    rx.await.map_err(|_| eyre!("Engine dropped the request"))?
  }

  /// Signal that connectivity came back; queued requests are replayed.
  pub fn connectivity_restored(&self) {
    let _ = self.tx.send(EngineEvent::Sync {
      reason: SyncReason::ConnectivityRestored,
    });
  }

  /// Deliver a raw push payload.
  pub fn push(&self, payload: Vec<u8>) {
    let _ = self.tx.send(EngineEvent::Push { payload });
  }

  /// Report a click on a displayed notification.
  pub fn notification_click(&self, notification: DisplayedNotification) {
    let _ = self.tx.send(EngineEvent::NotificationClick { notification });
  }

  /// Attach a view to the client event stream.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.broadcaster.subscribe()
  }
}

/// State shared between the actor loop and its spawned handlers.
struct EngineShared {
  rules: RuleSet,
  strategies: StrategyEngine,
  store: Arc<dyn CacheStore>,
  queue: Arc<RetryQueue>,
  net: HttpClient,
  dispatcher: NotificationDispatcher,
  host: Arc<dyn HostSink>,
  broadcaster: Broadcaster,
  /// (cache name, entry key) of the configured offline document
  offline_fallback: Option<(String, String)>,
}

/// The offline cache and background-sync engine.
pub struct Engine {
  config: Config,
  shared: Arc<EngineShared>,
  tx: mpsc::UnboundedSender<EngineEvent>,
  rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
  pub fn new(
    config: Config,
    store: Arc<dyn CacheStore>,
    queue: Arc<RetryQueue>,
    net: HttpClient,
    host: Arc<dyn HostSink>,
  ) -> Result<(Self, EngineHandle)> {
    let rules = RuleSet::build(
      config.rules.clone(),
      config.shell.routes.clone(),
      &config.version,
    )?;

    let shell_cache = generation::tagged(&config.shell.cache, &config.version);
    let offline_fallback = match &config.shell.offline_document {
      Some(document) => {
        let url = config.shell_url(document)?;
        let descriptor =
          RequestDescriptor::new(Method::Get, url.as_str(), Destination::Document)?;
        Some((shell_cache, descriptor.storage_key()))
      }
      None => None,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let broadcaster = Broadcaster::default();

    let shared = Arc::new(EngineShared {
      rules,
      strategies: StrategyEngine::new(Arc::clone(&store), Arc::clone(&queue)),
      store,
      queue,
      net,
      dispatcher: NotificationDispatcher::new(config.notifications.default_title.clone()),
      host,
      broadcaster: broadcaster.clone(),
      offline_fallback,
    });

    let handle = EngineHandle {
      tx: tx.clone(),
      broadcaster,
    };

    Ok((
      Self {
        config,
        shared,
        tx,
        rx,
      },
      handle,
    ))
  }

  /// Activate, then serve events until every handle is dropped.
  pub async fn run(mut self) -> Result<()> {
    self.activate().await?;
    self.spawn_periodic_sync();

    // Only handles (and the weak tick sender) keep the inbox open now.
    drop(self.tx);

    while let Some(event) = self.rx.recv().await {
      match event {
        EngineEvent::Fetch { request, reply } => {
          let shared = Arc::clone(&self.shared);
          tokio::spawn(async move {
            let result = shared.handle_fetch(&request).await;
            let _ = reply.send(result);
          });
        }
        EngineEvent::Sync { reason } => {
          let shared = Arc::clone(&self.shared);
          tokio::spawn(async move {
            shared.drain_all(reason).await;
          });
        }
        EngineEvent::Push { payload } => {
          let shown = self.shared.dispatcher.on_push(&payload);
          self.shared.host.display(&shown);
        }
        EngineEvent::NotificationClick { notification } => {
          let path = self.shared.dispatcher.on_click(&notification);
          self.shared.host.navigate(&path);
        }
      }
    }

    Ok(())
  }

  /// Reconcile cache generations and precache the app shell. Runs to
  /// completion before any request is served.
  async fn activate(&self) -> Result<()> {
    let deleted = generation::reconcile(self.shared.store.as_ref(), &self.config.version)?;
    if !deleted.is_empty() {
      info!(count = deleted.len(), version = %self.config.version, "reconciled cache generations");
    }

    self.precache_shell().await;

    let queues = self.shared.rules.queue_names();
    if !queues.is_empty() {
      debug!(queues = ?queues, "retry queues declared by rules");
    }

    self.shared.broadcaster.emit(ClientEvent::ActivationComplete);
    info!(version = %self.config.version, "activation complete");

    Ok(())
  }

  /// Fetch and store every configured shell route plus the offline
  /// document. Individual failures are logged, not fatal.
  async fn precache_shell(&self) {
    let shell_cache = generation::tagged(&self.config.shell.cache, &self.config.version);

    let mut routes = self.config.shell.routes.clone();
    if let Some(document) = &self.config.shell.offline_document {
      routes.push(document.clone());
    }

    for route in routes {
      if let Err(e) = self.precache_route(&shell_cache, &route).await {
        warn!(route = %route, error = %e, "shell precache failed");
      }
    }
  }

  async fn precache_route(&self, shell_cache: &str, route: &str) -> Result<()> {
    let url = self.config.shell_url(route)?;
    let descriptor = RequestDescriptor::new(Method::Get, url.as_str(), Destination::Document)?;
    let request = InterceptedRequest::new(descriptor.clone());

    let response = self.shared.net.fetch(&request.to_serialized()).await?;
    if !response.is_cacheable_success() {
      return Err(eyre!("unexpected status {}", response.status));
    }

    self
      .shared
      .store
      .put(shell_cache, &descriptor.storage_key(), &response, None)
  }

  fn spawn_periodic_sync(&self) {
    if self.config.sync.periodic_seconds == 0 {
      return;
    }

    let interval = Duration::from_secs(self.config.sync.periodic_seconds);
    let tx = self.tx.downgrade();

    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;

        let tx = match tx.upgrade() {
          Some(tx) => tx,
          None => break,
        };
        if tx
          .send(EngineEvent::Sync {
            reason: SyncReason::Periodic,
          })
          .is_err()
        {
          break;
        }
      }
    });
  }
}

impl EngineShared {
  /// Route one intercepted request through the rule table. Unmatched
  /// requests pass through to the network untouched.
  async fn handle_fetch(&self, request: &InterceptedRequest) -> Result<ResponsePayload> {
    let rule = match self.rules.resolve(request) {
      Some(rule) => rule,
      // Unmatched requests pass through unmodified
      None => return self.net.fetch(&request.to_serialized()).await,
    };

    match self.strategies.handle(rule, request, &self.net).await {
      Ok(response) => Ok(response),
      Err(e) => match self.offline_document(request) {
        Some(fallback) => {
          debug!(url = %request.descriptor.url, "serving offline document");
          Ok(fallback)
        }
        None => Err(e),
      },
    }
  }

  /// The configured offline document, for exhausted full-page navigations
  /// only.
  fn offline_document(&self, request: &InterceptedRequest) -> Option<ResponsePayload> {
    if request.descriptor.destination != Destination::Document {
      return None;
    }

    let (cache_name, key) = self.offline_fallback.as_ref()?;
    match self.store.get(cache_name, key) {
      Ok(Some(hit)) => Some(hit.response),
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, "offline document lookup failed");
        None
      }
    }
  }

  /// Replay every queue holding entries. Per-queue exclusion lives in the
  /// queue itself; a drain already in flight is skipped.
  async fn drain_all(&self, reason: SyncReason) {
    let names = match self.queue.queue_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "could not list retry queues");
        return;
      }
    };

    for name in names {
      let net = self.net.clone();
      let outcome = self
        .queue
        .drain(&name, move |request| {
          let net = net.clone();
          async move { net.fetch(&request).await }
        })
        .await;

      match outcome {
        Ok(DrainOutcome::Ran(report)) => {
          info!(
            queue = %name,
            reason = ?reason,
            replayed = report.replayed,
            dropped = report.dropped,
            remaining = report.remaining,
            "queue drain finished"
          );
          for _ in 0..report.replayed {
            self.broadcaster.emit(ClientEvent::QueueReplaySucceeded {
              queue: name.clone(),
            });
          }
        }
        Ok(DrainOutcome::AlreadyDraining) => {
          debug!(queue = %name, "drain already in flight");
        }
        Err(e) => {
          warn!(queue = %name, error = %e, "queue drain failed");
        }
      }
    }
  }
}
