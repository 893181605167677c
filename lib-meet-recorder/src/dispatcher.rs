use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
};

use futures::stream::{Stream, StreamExt};
use parking_lot::{ReentrantMutex, RwLock};
use tracing::{trace, warn};
use xmpp_parsers::{Element, Jid};

use crate::stanza_filter::{FnFilter, StanzaFilter};

/// Handle returned by [`StanzaDispatcher::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

struct Subscription {
  id: SubscriptionId,
  active: AtomicBool,
  /// Held for the whole of each delivery. Reentrant so a filter may unsubscribe itself.
  delivering: ReentrantMutex<()>,
  filter: Box<dyn StanzaFilter>,
}

/// Fans inbound stanzas out to every subscribed filter that accepts them.
///
/// Each delivery iterates over a snapshot of the subscription list taken under a read lock, so
/// filters may subscribe or unsubscribe (themselves or others) from inside `take` without
/// deadlocking. A subscription is marked inactive before it is removed, and the flag is checked
/// under the subscription's delivery lock. `unsubscribe` then waits on that lock, so once it
/// returns the filter is not running on another thread and will not be called again.
#[derive(Default)]
pub struct StanzaDispatcher {
  next_id: AtomicU64,
  subscriptions: RwLock<Vec<Arc<Subscription>>>,
  local_jid: RwLock<Option<Jid>>,
}

impl fmt::Debug for StanzaDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StanzaDispatcher")
      .field("subscriptions", &self.subscriptions.read().len())
      .field("local_jid", &*self.local_jid.read())
      .finish()
  }
}

impl StanzaDispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_stanza_filter(&self, filter: impl StanzaFilter + 'static) -> SubscriptionId {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.subscriptions.write().push(Arc::new(Subscription {
      id,
      active: AtomicBool::new(true),
      delivering: ReentrantMutex::new(()),
      filter: Box::new(filter),
    }));
    id
  }

  /// Invokes `handler` for every delivered stanza for which `predicate` holds.
  pub fn subscribe<P, H>(&self, predicate: P, handler: H) -> SubscriptionId
  where
    P: Fn(&Element) -> bool + Send + Sync + 'static,
    H: Fn(&Element) + Send + Sync + 'static,
  {
    self.add_stanza_filter(FnFilter { predicate, handler })
  }

  /// Returns false if `id` was not (or is no longer) subscribed.
  ///
  /// Blocks while the filter is being delivered to on another thread. Called from inside the
  /// filter's own `take`, it returns immediately.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let removed = {
      let mut subscriptions = self.subscriptions.write();
      match subscriptions.iter().position(|subscription| subscription.id == id) {
        Some(index) => subscriptions.remove(index),
        None => return false,
      }
    };
    removed.active.store(false, Ordering::SeqCst);
    drop(removed.delivering.lock());
    true
  }

  /// Once set, stanzas explicitly addressed to any other JID are dropped before delivery.
  pub fn set_local_jid(&self, jid: Jid) {
    *self.local_jid.write() = Some(jid);
  }

  pub fn local_jid(&self) -> Option<Jid> {
    self.local_jid.read().clone()
  }

  pub fn dispatch(&self, element: &Element) {
    if !self.addressed_to_us(element) {
      return;
    }
    let snapshot: Vec<_> = self.subscriptions.read().clone();
    for subscription in snapshot {
      let _delivering = subscription.delivering.lock();
      if subscription.active.load(Ordering::SeqCst)
        && subscription.filter.filter(element)
        && subscription.active.load(Ordering::SeqCst)
      {
        trace!("delivering {} to subscription {:?}", element.name(), subscription.id);
        subscription.filter.take(element);
      }
    }
  }

  /// Dispatches every stanza from `stream`, in order, until it ends.
  pub async fn run<S>(&self, stream: S)
  where
    S: Stream<Item = Element>,
  {
    futures::pin_mut!(stream);
    while let Some(element) = stream.next().await {
      self.dispatch(&element);
    }
  }

  fn addressed_to_us(&self, element: &Element) -> bool {
    let local_jid = self.local_jid.read();
    let (local_jid, to) = match (local_jid.as_ref(), element.attr("to")) {
      (Some(local_jid), Some(to)) => (local_jid, to),
      _ => return true,
    };
    match to.parse::<Jid>() {
      Ok(to) if &to == local_jid => true,
      _ => {
        warn!(
          "dropping stanza addressed to {}, but we are {}",
          to, local_jid
        );
        false
      },
    }
  }
}
