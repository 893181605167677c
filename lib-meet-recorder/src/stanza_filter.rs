use xmpp_parsers::Element;

/// A consumer of inbound stanzas registered with the
/// [`StanzaDispatcher`](crate::dispatcher::StanzaDispatcher).
///
/// `take` is called synchronously from the delivery loop for every stanza `filter` accepts, so
/// it must return promptly; anything that needs to await should be spawned.
pub trait StanzaFilter: Send + Sync {
  fn filter(&self, element: &Element) -> bool;
  fn take(&self, element: &Element);
}

pub(crate) struct FnFilter<P, H> {
  pub(crate) predicate: P,
  pub(crate) handler: H,
}

impl<P, H> StanzaFilter for FnFilter<P, H>
where
  P: Fn(&Element) -> bool + Send + Sync,
  H: Fn(&Element) + Send + Sync,
{
  fn filter(&self, element: &Element) -> bool {
    (self.predicate)(element)
  }

  fn take(&self, element: &Element) {
    (self.handler)(element)
  }
}
