//! Named events emitted to every open client view.
//!
//! Views subscribe to hear about queue replays and activation so they can
//! show toast confirmations; the engine never waits on them.

use tokio::sync::broadcast;

/// Events consumed by UI components in open views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
  /// A queued request was replayed successfully
  QueueReplaySucceeded { queue: String },
  /// Generation reconciliation and precaching finished
  ActivationComplete,
}

/// Fan-out sender for client events.
#[derive(Clone)]
pub struct Broadcaster {
  tx: broadcast::Sender<ClientEvent>,
}

impl Broadcaster {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Attach a new view. Each subscriber sees every event emitted after
  /// this call.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.tx.subscribe()
  }

  /// Emit an event. Having no open views is not an error.
  pub fn emit(&self, event: ClientEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for Broadcaster {
  fn default() -> Self {
    Self::new(64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_all_subscribers_receive_events() {
    let broadcaster = Broadcaster::default();
    let mut a = broadcaster.subscribe();
    let mut b = broadcaster.subscribe();

    broadcaster.emit(ClientEvent::QueueReplaySucceeded {
      queue: "contact-form".to_string(),
    });

    let expected = ClientEvent::QueueReplaySucceeded {
      queue: "contact-form".to_string(),
    };
    assert_eq!(a.recv().await.unwrap(), expected);
    assert_eq!(b.recv().await.unwrap(), expected);
  }

  #[tokio::test]
  async fn test_emit_without_subscribers_is_fine() {
    let broadcaster = Broadcaster::default();
    broadcaster.emit(ClientEvent::ActivationComplete);
  }
}
