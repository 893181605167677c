use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use xmpp_parsers::{
  muc::Muc,
  presence::{Presence, Type as PresenceType},
  BareJid, Element, FullJid, Jid,
};

use crate::{
  dispatcher::StanzaDispatcher,
  error::{Error, JoinError},
  transport::Transport,
  wait::{Stage, StanzaWaiter, WaitError},
  xmpp,
};

/// Our occupancy of the conference room.
pub(crate) struct MucMembership {
  transport: Arc<dyn Transport>,
  dispatcher: Arc<StanzaDispatcher>,
  occupant: Mutex<Option<FullJid>>,
}

impl MucMembership {
  pub(crate) fn new(transport: Arc<dyn Transport>, dispatcher: Arc<StanzaDispatcher>) -> Self {
    Self {
      transport,
      dispatcher,
      occupant: Mutex::new(None),
    }
  }

  pub(crate) fn occupant(&self) -> Option<FullJid> {
    self.occupant.lock().clone()
  }

  /// Sends our presence to `room/nick` and waits for the room to reflect it back.
  #[tracing::instrument(level = "debug", skip(self, cancel), err)]
  pub(crate) async fn join(
    &self,
    room: &BareJid,
    nick: &str,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<FullJid, JoinError> {
    if let Some(occupant) = self.occupant() {
      debug!("already joined as {}", occupant);
      return Ok(occupant);
    }

    let occupant = room.clone().with_resource(nick);
    let echo_from = Jid::Full(occupant.clone());
    let waiter = StanzaWaiter::register(self.dispatcher.clone(), Stage::RoomJoin, move |element| {
      element.is("presence", xmpp::ns::CLIENT)
        && element
          .attr("from")
          .and_then(|from| from.parse::<Jid>().ok())
          .map(|from| from == echo_from)
          .unwrap_or(false)
    });

    let presence = Presence::new(PresenceType::None)
      .with_to(Jid::Full(occupant.clone()))
      .with_payloads(vec![Muc::new().into()]);
    self
      .transport
      .send(presence.into())
      .await
      .map_err(JoinError::Transport)?;

    let echo = waiter.wait(timeout, cancel).await.map_err(|e| match e {
      WaitError::TimedOut => JoinError::Timeout(timeout),
      WaitError::Cancelled => JoinError::Cancelled,
    })?;
    if echo.attr("type") == Some("error") {
      return Err(rejection(&echo));
    }

    info!("joined {}", occupant);
    *self.occupant.lock() = Some(occupant.clone());
    Ok(occupant)
  }

  /// Sends unavailable presence to the room. Does nothing if we are not in it.
  pub(crate) async fn leave(&self) -> Result<(), Error> {
    let occupant = match self.occupant.lock().take() {
      Some(occupant) => occupant,
      None => return Ok(()),
    };
    let presence = Presence::new(PresenceType::Unavailable).with_to(Jid::Full(occupant.clone()));
    self
      .transport
      .send(presence.into())
      .await
      .map_err(Error::Transport)?;
    info!("left {}", occupant);
    Ok(())
  }
}

fn rejection(presence: &Element) -> JoinError {
  let (condition, text) = xmpp::stanza_error_condition(presence)
    .unwrap_or_else(|| ("undefined-condition".to_owned(), None));
  JoinError::Rejected { condition, text }
}
