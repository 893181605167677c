use std::{
  collections::BTreeMap,
  convert::TryFrom,
  sync::Arc,
  time::Duration,
};

use anyhow::{anyhow, Context};
use maplit::btreemap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xmpp_parsers::{
  iq::{Iq, IqType},
  jingle::{Action, Jingle, Reason, ReasonElement, SessionId},
  ns, Element, Jid,
};

use crate::{
  catalog::{Codec, MediaCatalog},
  content::{build_accept, media_content, FingerprintProvider, TransportManager},
  context::{SessionContext, SessionIdentity},
  dispatcher::StanzaDispatcher,
  error::{Error, Result},
  source::MediaType,
  transport::Transport,
  util::generate_id,
  wait::{Stage, StanzaWaiter, WaitError},
  xmpp,
};

/// Progress of the Jingle handshake with the focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  Idle,
  AwaitingInitiate,
  InitiateReceived,
  AcceptSent,
  Established,
  Terminating,
  Terminated,
}

/// How the acknowledgement of our session-accept is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatching {
  /// Only an IQ result or error carrying the session-accept's id.
  AcceptId,
  /// The first IQ result of any id observed after the session-accept is sent.
  ///
  /// Any unrelated result that arrives in that window is taken as the acknowledgement, such as
  /// the reply to the connection's 30 second keepalive ping. A rejection of the accept is never
  /// seen.
  AnyResult,
}

impl Default for AckMatching {
  fn default() -> Self {
    AckMatching::AcceptId
  }
}

/// The parsed session-initiate, as handed back to the recording pipeline.
#[derive(Debug, Clone)]
pub struct SessionInitiate {
  pub sid: String,
  pub local: Jid,
  pub remote: Jid,
  pub codecs: BTreeMap<MediaType, Vec<Codec>>,
  pub jingle: Jingle,
}

impl SessionInitiate {
  /// The payload type negotiated for the codec named `name` (case-insensitive).
  pub fn payload_type(&self, media_type: MediaType, name: &str) -> Option<u8> {
    self
      .codecs
      .get(&media_type)?
      .iter()
      .find(|codec| codec.name.eq_ignore_ascii_case(name))
      .map(|codec| codec.payload_type)
  }
}

pub(crate) fn is_session_initiate(element: &Element) -> bool {
  element.is("iq", xmpp::ns::CLIENT)
    && element.attr("type") == Some("set")
    && element
      .get_child("jingle", ns::JINGLE)
      .map(|jingle| jingle.attr("action") == Some("session-initiate"))
      .unwrap_or(false)
}

fn ack_predicate(
  matching: AckMatching,
  accept_id: String,
) -> Box<dyn Fn(&Element) -> bool + Send + Sync> {
  match matching {
    AckMatching::AcceptId => Box::new(move |element: &Element| {
      element.is("iq", xmpp::ns::CLIENT)
        && element.attr("id") == Some(accept_id.as_str())
        && matches!(element.attr("type"), Some("result") | Some("error"))
    }),
    AckMatching::AnyResult => Box::new(|element: &Element| {
      element.is("iq", xmpp::ns::CLIENT) && element.attr("type") == Some("result")
    }),
  }
}

fn wait_error(stage: Stage, error: WaitError) -> Error {
  match error {
    WaitError::TimedOut => Error::HandshakeTimeout(stage),
    WaitError::Cancelled => Error::Cancelled(stage),
  }
}

/// The Jingle half of a recording session: receives the focus's session-initiate, answers it
/// with a session-accept and waits for that to be acknowledged.
pub(crate) struct JingleHandshake {
  transport: Arc<dyn Transport>,
  dispatcher: Arc<StanzaDispatcher>,
  context: Arc<SessionContext>,
  ack_matching: AckMatching,
  timeout: Duration,
  state: Mutex<HandshakeState>,
}

impl JingleHandshake {
  pub(crate) fn new(
    transport: Arc<dyn Transport>,
    dispatcher: Arc<StanzaDispatcher>,
    context: Arc<SessionContext>,
    ack_matching: AckMatching,
    timeout: Duration,
  ) -> Self {
    Self {
      transport,
      dispatcher,
      context,
      ack_matching,
      timeout,
      state: Mutex::new(HandshakeState::Idle),
    }
  }

  pub(crate) fn state(&self) -> HandshakeState {
    *self.state.lock()
  }

  fn transition(
    &self,
    operation: &'static str,
    from: &[HandshakeState],
    to: HandshakeState,
  ) -> Result<()> {
    let mut state = self.state.lock();
    if !from.contains(&*state) {
      return Err(Error::InvalidState {
        operation,
        state: *state,
      });
    }
    debug!("handshake state {:?} -> {:?}", *state, to);
    *state = to;
    Ok(())
  }

  /// Starts capturing session-initiates. Must be called before anything that may cause the
  /// focus to send one, i.e. before joining the room.
  pub(crate) fn expect_initiate(&self) -> Result<StanzaWaiter> {
    let state = self.state();
    if state != HandshakeState::Idle {
      return Err(Error::InvalidState {
        operation: "expect session-initiate",
        state,
      });
    }
    Ok(StanzaWaiter::register(
      self.dispatcher.clone(),
      Stage::SessionInitiate,
      is_session_initiate,
    ))
  }

  /// Waits for the session-initiate, records it in the session context and acknowledges it.
  pub(crate) async fn receive_initiate(
    &self,
    waiter: StanzaWaiter,
    catalog: &dyn MediaCatalog,
    cancel: &CancellationToken,
  ) -> Result<SessionInitiate> {
    self.transition(
      "await session-initiate",
      &[HandshakeState::Idle],
      HandshakeState::AwaitingInitiate,
    )?;
    let element = waiter
      .wait(self.timeout, cancel)
      .await
      .map_err(|e| wait_error(Stage::SessionInitiate, e))?;

    let (iq_id, initiate) = self.parse_initiate(element, catalog)?;
    self
      .context
      .record_initiate(
        SessionIdentity {
          sid: initiate.sid.clone(),
          local: initiate.local.clone(),
          remote: initiate.remote.clone(),
        },
        initiate.codecs.clone(),
      )?;
    self.dispatcher.set_local_jid(initiate.local.clone());
    self.transition(
      "receive session-initiate",
      &[HandshakeState::AwaitingInitiate],
      HandshakeState::InitiateReceived,
    )?;
    info!("received session-initiate {} from {}", initiate.sid, initiate.remote);

    let ack = Iq::empty_result(initiate.remote.clone(), iq_id).with_from(initiate.local.clone());
    self
      .transport
      .send(ack.into())
      .await
      .map_err(Error::Transport)?;

    Ok(initiate)
  }

  fn parse_initiate(
    &self,
    element: Element,
    catalog: &dyn MediaCatalog,
  ) -> Result<(String, SessionInitiate)> {
    let iq = Iq::try_from(element)
      .context("failed to parse session-initiate IQ")
      .map_err(Error::InvalidInitiate)?;
    let remote = iq
      .from
      .ok_or_else(|| Error::InvalidInitiate(anyhow!("session-initiate has no sender")))?;
    let local = iq
      .to
      .or_else(|| self.dispatcher.local_jid())
      .ok_or_else(|| Error::InvalidInitiate(anyhow!("session-initiate has no recipient")))?;
    let jingle = match iq.payload {
      IqType::Set(element) => Jingle::try_from(element)
        .context("failed to parse jingle")
        .map_err(Error::InvalidInitiate)?,
      _ => return Err(Error::InvalidInitiate(anyhow!("not an IQ set"))),
    };

    let codecs = MediaType::ALL
      .iter()
      .filter_map(|media_type| {
        let (_, description) = media_content(&jingle, *media_type)?;
        let codecs = catalog.negotiate(*media_type, &description.payload_types);
        debug!(
          "{} codecs: {:?}",
          media_type,
          codecs
            .iter()
            .map(|codec| (&codec.name, codec.payload_type))
            .collect::<Vec<_>>()
        );
        Some((*media_type, codecs))
      })
      .collect();

    Ok((
      iq.id,
      SessionInitiate {
        sid: jingle.sid.0.clone(),
        local,
        remote,
        codecs,
        jingle,
      },
    ))
  }

  /// Sends the session-accept for `initiate` and waits for the focus to acknowledge it.
  pub(crate) async fn accept(
    &self,
    initiate: &SessionInitiate,
    transports: &dyn TransportManager,
    fingerprints: &dyn FingerprintProvider,
    cname: &str,
    cancel: &CancellationToken,
  ) -> Result<()> {
    let state = self.state();
    if state != HandshakeState::InitiateReceived {
      return Err(Error::InvalidState {
        operation: "send session-accept",
        state,
      });
    }

    let accept = build_accept(&self.context, &initiate.jingle, transports, fingerprints, cname)?;
    let accept_id = generate_id();
    let waiter = StanzaWaiter::register(
      self.dispatcher.clone(),
      Stage::SessionAcceptAck,
      ack_predicate(self.ack_matching, accept_id.clone()),
    );

    let iq = Iq::from_set(accept_id.clone(), accept)
      .with_to(initiate.remote.clone())
      .with_from(initiate.local.clone());
    self
      .transport
      .send(iq.into())
      .await
      .map_err(Error::Transport)?;
    self.transition(
      "send session-accept",
      &[HandshakeState::InitiateReceived],
      HandshakeState::AcceptSent,
    )?;
    info!("sent session-accept {}", accept_id);

    let ack = waiter
      .wait(self.timeout, cancel)
      .await
      .map_err(|e| wait_error(Stage::SessionAcceptAck, e))?;
    if ack.attr("type") == Some("error") {
      let condition = xmpp::stanza_error_condition(&ack)
        .map(|(condition, _)| condition)
        .unwrap_or_else(|| "undefined-condition".to_owned());
      warn!("session-accept rejected: {}", condition);
      return Err(Error::AcceptRejected(condition));
    }
    if ack.attr("id") != Some(accept_id.as_str()) {
      debug!(
        "accepting result {:?} as acknowledgement of {}",
        ack.attr("id"),
        accept_id
      );
    }

    self.transition(
      "establish session",
      &[HandshakeState::AcceptSent],
      HandshakeState::Established,
    )?;
    info!("session {} established", initiate.sid);
    Ok(())
  }

  /// Moves to `Terminating` and sends a session-terminate naming the recorded sid.
  ///
  /// Before a session-initiate has been received there is no sid to name, so nothing is sent
  /// and only the state changes. Returns false if the handshake had already terminated.
  pub(crate) async fn terminate(&self, reason: Reason, text: Option<String>) -> Result<bool> {
    {
      let mut state = self.state.lock();
      if *state == HandshakeState::Terminated {
        return Ok(false);
      }
      debug!("handshake state {:?} -> {:?}", *state, HandshakeState::Terminating);
      *state = HandshakeState::Terminating;
    }

    let identity = match self.context.identity() {
      Some(identity) => identity,
      None => {
        debug!("no session to terminate");
        return Ok(true);
      },
    };
    let texts = text
      .filter(|text| !text.is_empty())
      .map(|text| btreemap! { "en".to_owned() => text })
      .unwrap_or_default();
    info!("terminating session {} ({:?})", identity.sid, reason);
    let terminate = Jingle::new(Action::SessionTerminate, SessionId(identity.sid.clone()))
      .set_reason(ReasonElement { reason, texts });
    let iq = Iq::from_set(generate_id(), terminate)
      .with_to(identity.remote)
      .with_from(identity.local);
    self
      .transport
      .send(iq.into())
      .await
      .map_err(Error::Transport)?;
    Ok(true)
  }

  pub(crate) fn finish(&self) {
    let mut state = self.state.lock();
    debug!("handshake state {:?} -> {:?}", *state, HandshakeState::Terminated);
    *state = HandshakeState::Terminated;
  }
}
