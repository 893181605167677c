use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
  sync::Notify,
  time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use xmpp_parsers::Element;

use crate::dispatcher::{StanzaDispatcher, SubscriptionId};

/// The step of room entry or the Jingle handshake a bounded wait belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  RoomJoin,
  SessionInitiate,
  SessionAcceptAck,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Stage::RoomJoin => "room join",
      Stage::SessionInitiate => "session-initiate",
      Stage::SessionAcceptAck => "session-accept acknowledgement",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
  TimedOut,
  Cancelled,
}

/// Captures the first stanza matching a predicate, from the moment it is registered.
///
/// Register before sending whatever provokes the awaited stanza, then call [`wait`](Self::wait).
/// The subscription is removed when the waiter is dropped.
pub(crate) struct StanzaWaiter {
  dispatcher: Arc<StanzaDispatcher>,
  subscription: SubscriptionId,
  slot: Arc<Mutex<Option<Element>>>,
  notify: Arc<Notify>,
  stage: Stage,
}

impl StanzaWaiter {
  pub(crate) fn register<P>(dispatcher: Arc<StanzaDispatcher>, stage: Stage, predicate: P) -> Self
  where
    P: Fn(&Element) -> bool + Send + Sync + 'static,
  {
    let slot = Arc::new(Mutex::new(None));
    let notify = Arc::new(Notify::new());
    let slot_ = slot.clone();
    let notify_ = notify.clone();
    let subscription = dispatcher.subscribe(predicate, move |element| {
      let mut slot = slot_.lock();
      if slot.is_none() {
        *slot = Some(element.clone());
        notify_.notify_one();
      }
    });
    Self {
      dispatcher,
      subscription,
      slot,
      notify,
      stage,
    }
  }

  /// Resolves with the captured stanza, or fails once `timeout` elapses or `cancel` fires.
  ///
  /// The slot is re-checked after every wake-up, so a notification is only ever a hint; a stanza
  /// that lands concurrently with the deadline or the cancellation is still returned.
  pub(crate) async fn wait(
    self,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<Element, WaitError> {
    let deadline = Instant::now() + timeout;
    debug!("waiting up to {:?} for {}", timeout, self.stage);
    loop {
      if let Some(element) = self.slot.lock().take() {
        return Ok(element);
      }
      let outcome = tokio::select! {
        _ = self.notify.notified() => None,
        _ = time::sleep_until(deadline) => Some(WaitError::TimedOut),
        _ = cancel.cancelled() => Some(WaitError::Cancelled),
      };
      if let Some(error) = outcome {
        return match self.slot.lock().take() {
          Some(element) => Ok(element),
          None => {
            debug!("gave up waiting for {}: {:?}", self.stage, error);
            Err(error)
          },
        };
      }
    }
  }
}

impl Drop for StanzaWaiter {
  fn drop(&mut self) {
    self.dispatcher.unsubscribe(self.subscription);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn iq(kind: &str) -> Element {
    format!("<iq xmlns='jabber:client' type='{}' id='x'/>", kind)
      .parse()
      .unwrap()
  }

  fn waiter(dispatcher: &Arc<StanzaDispatcher>) -> StanzaWaiter {
    StanzaWaiter::register(dispatcher.clone(), Stage::SessionAcceptAck, |element| {
      element.attr("type") == Some("result")
    })
  }

  #[tokio::test(start_paused = true)]
  async fn times_out_without_a_qualifying_stanza() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    let waiter = waiter(&dispatcher);
    dispatcher.dispatch(&iq("get"));

    let started = Instant::now();
    let result = waiter.wait(Duration::from_secs(20), &CancellationToken::new()).await;
    assert_eq!(result, Err(WaitError::TimedOut));
    assert!(started.elapsed() >= Duration::from_secs(20));
  }

  #[tokio::test(start_paused = true)]
  async fn returns_stanza_delivered_before_waiting_began() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    let waiter = waiter(&dispatcher);
    dispatcher.dispatch(&iq("result"));

    let element = waiter
      .wait(Duration::from_secs(20), &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(element.attr("type"), Some("result"));
  }

  #[tokio::test(start_paused = true)]
  async fn returns_stanza_delivered_while_waiting() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    let waiter = waiter(&dispatcher);

    let dispatcher_ = dispatcher.clone();
    tokio::spawn(async move {
      time::sleep(Duration::from_secs(5)).await;
      dispatcher_.dispatch(&iq("error"));
      dispatcher_.dispatch(&iq("result"));
    });

    let started = Instant::now();
    let element = waiter
      .wait(Duration::from_secs(20), &CancellationToken::new())
      .await
      .unwrap();
    assert_eq!(element.attr("type"), Some("result"));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(20));
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_is_distinct_from_timeout() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    let waiter = waiter(&dispatcher);
    let cancel = CancellationToken::new();

    let cancel_ = cancel.clone();
    tokio::spawn(async move {
      time::sleep(Duration::from_secs(1)).await;
      cancel_.cancel();
    });

    assert_eq!(
      waiter.wait(Duration::from_secs(20), &cancel).await,
      Err(WaitError::Cancelled)
    );
  }

  #[tokio::test]
  async fn stanza_wins_over_pending_cancellation() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    let waiter = waiter(&dispatcher);
    let cancel = CancellationToken::new();
    cancel.cancel();
    dispatcher.dispatch(&iq("result"));

    assert!(waiter.wait(Duration::from_secs(20), &cancel).await.is_ok());
  }

  #[test]
  fn dropping_the_waiter_unsubscribes() {
    let dispatcher = Arc::new(StanzaDispatcher::new());
    drop(waiter(&dispatcher));
    assert!(!dispatcher.unsubscribe(SubscriptionId(0)));
  }
}
