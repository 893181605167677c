use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::info;
use xmpp_parsers::{jingle::Reason, BareJid, FullJid};

use crate::{
  catalog::MediaCatalog,
  content::{FingerprintProvider, TransportManager},
  context::SessionContext,
  dispatcher::{StanzaDispatcher, SubscriptionId},
  error::Result,
  jingle::{AckMatching, HandshakeState, JingleHandshake, SessionInitiate},
  muc::MucMembership,
  presence::PresenceTracker,
  transport::Transport,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub room: BareJid,
  pub nick: String,
  pub ack_matching: AckMatching,
  /// Bound on each of the waits for the session-initiate and for the accept acknowledgement.
  pub handshake_timeout: Duration,
  pub join_timeout: Duration,
}

impl SessionConfig {
  pub fn new(room: BareJid, nick: impl Into<String>) -> Self {
    Self {
      room,
      nick: nick.into(),
      ack_matching: AckMatching::default(),
      handshake_timeout: DEFAULT_TIMEOUT,
      join_timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_ack_matching(mut self, ack_matching: AckMatching) -> Self {
    self.ack_matching = ack_matching;
    self
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
    self.join_timeout = timeout;
    self
  }
}

/// A recording participant in one conference: room membership, the Jingle session with the
/// focus, and the participant SSRCs learned from presence.
pub struct RecordingSession {
  config: SessionConfig,
  dispatcher: Arc<StanzaDispatcher>,
  catalog: Arc<dyn MediaCatalog>,
  context: Arc<SessionContext>,
  membership: MucMembership,
  handshake: JingleHandshake,
  presence_subscription: SubscriptionId,
  cancel: CancellationToken,
}

impl fmt::Debug for RecordingSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecordingSession")
      .field("config", &self.config)
      .field("state", &self.state())
      .field("occupant", &self.membership.occupant())
      .finish()
  }
}

impl RecordingSession {
  /// Creates the session and starts tracking participant SSRCs from room presence.
  pub fn new(
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<StanzaDispatcher>,
    catalog: Arc<dyn MediaCatalog>,
  ) -> Self {
    let context = Arc::new(SessionContext::new(config.room.clone()));
    let presence_subscription =
      dispatcher.add_stanza_filter(PresenceTracker::new(context.clone()));
    Self {
      membership: MucMembership::new(transport.clone(), dispatcher.clone()),
      handshake: JingleHandshake::new(
        transport,
        dispatcher.clone(),
        context.clone(),
        config.ack_matching,
        config.handshake_timeout,
      ),
      config,
      dispatcher,
      catalog,
      context,
      presence_subscription,
      cancel: CancellationToken::new(),
    }
  }

  pub fn state(&self) -> HandshakeState {
    self.handshake.state()
  }

  pub fn context(&self) -> &Arc<SessionContext> {
    &self.context
  }

  pub fn occupant(&self) -> Option<FullJid> {
    self.membership.occupant()
  }

  /// Cancelling this token interrupts whichever wait `connect` is blocked in.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Joins the room and completes the Jingle handshake with the focus.
  #[tracing::instrument(level = "debug", skip(self, transports, fingerprints), err)]
  pub async fn connect(
    &self,
    transports: &dyn TransportManager,
    fingerprints: &dyn FingerprintProvider,
  ) -> Result<SessionInitiate> {
    // the focus may send the initiate as soon as it sees us join
    let waiter = self.handshake.expect_initiate()?;
    self
      .membership
      .join(
        &self.config.room,
        &self.config.nick,
        self.config.join_timeout,
        &self.cancel,
      )
      .await?;
    let initiate = self
      .handshake
      .receive_initiate(waiter, self.catalog.as_ref(), &self.cancel)
      .await?;
    self
      .handshake
      .accept(
        &initiate,
        transports,
        fingerprints,
        &self.catalog.rtp_cname(),
        &self.cancel,
      )
      .await?;
    Ok(initiate)
  }

  /// Terminates the Jingle session and leaves the room. Safe to call in any state.
  ///
  /// A session-terminate is only sent once a session-initiate has been received, since until
  /// then the focus has assigned no sid. Leaving is skipped if the room was never joined.
  /// Interrupts a concurrent `connect`. Calling it again after it has completed does nothing.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn disconnect(&self, reason: Reason, text: &str) -> Result<()> {
    self.cancel.cancel();
    let terminated = self.handshake.terminate(reason, Some(text.to_owned())).await;
    if let Ok(false) = terminated {
      return Ok(());
    }
    let left = self.membership.leave().await;
    self.dispatcher.unsubscribe(self.presence_subscription);
    self.handshake.finish();
    info!("disconnected from {}", self.config.room);
    terminated?;
    left
  }
}

impl Drop for RecordingSession {
  fn drop(&mut self) {
    self.dispatcher.unsubscribe(self.presence_subscription);
  }
}

#[cfg(test)]
mod tests {
  use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{self, Instant},
  };
  use xmpp_parsers::{hashes::Algo, ns, Element};

  use super::*;
  use crate::{
    catalog::StaticCatalog,
    content::{LocalFingerprint, LocalTransport},
    error::{Error, JoinError},
    source::MediaType,
    transport::testing::{stanza, RecordingTransport},
    wait::Stage,
  };

  const ROOM_ECHO: &str = "<presence xmlns='jabber:client' from='room@conference.example.com/recorder' to='recorder@example.com/r'>\
      <x xmlns='http://jabber.org/protocol/muc#user'>\
        <item affiliation='none' role='participant' jid='recorder@example.com/r'/>\
        <status code='110'/>\
      </x>\
    </presence>";

  const INITIATE: &str = "<iq xmlns='jabber:client' type='set' id='init-1' from='room@conference.example.com/focus' to='recorder@example.com/r'>\
      <jingle xmlns='urn:xmpp:jingle:1' action='session-initiate' initiator='focus@auth.example.com/focus' sid='sid-1'>\
        <content creator='initiator' name='audio' senders='both'>\
          <description xmlns='urn:xmpp:jingle:apps:rtp:1' media='audio'>\
            <payload-type id='111' name='opus' clockrate='48000' channels='2'/>\
          </description>\
          <transport xmlns='urn:xmpp:jingle:transports:ice-udp:1' ufrag='abc' pwd='def'>\
            <fingerprint xmlns='urn:xmpp:jingle:apps:dtls:0' hash='sha-256' setup='actpass'>AA:BB</fingerprint>\
          </transport>\
        </content>\
      </jingle>\
    </iq>";

  struct FixedFingerprint;

  impl FingerprintProvider for FixedFingerprint {
    fn local_fingerprint(&self, _media_type: MediaType) -> LocalFingerprint {
      LocalFingerprint {
        hash: Algo::Sha_256,
        value: vec![0x01, 0x23, 0x45],
      }
    }
  }

  struct Harness {
    session: Arc<RecordingSession>,
    dispatcher: Arc<StanzaDispatcher>,
    transport: Arc<RecordingTransport>,
    rx: UnboundedReceiver<Element>,
  }

  impl Harness {
    fn new(config: SessionConfig) -> Self {
      let (transport, rx) = RecordingTransport::new();
      let transport = Arc::new(transport);
      let dispatcher = Arc::new(StanzaDispatcher::new());
      let session = Arc::new(RecordingSession::new(
        config,
        transport.clone(),
        dispatcher.clone(),
        Arc::new(StaticCatalog::default()),
      ));
      Self {
        session,
        dispatcher,
        transport,
        rx,
      }
    }

    fn spawn_connect(&self) -> JoinHandle<Result<SessionInitiate>> {
      let session = self.session.clone();
      tokio::spawn(async move {
        session
          .connect(&LocalTransport::generate(), &FixedFingerprint)
          .await
      })
    }

    async fn next_sent(&mut self) -> Element {
      self.rx.recv().await.unwrap()
    }

    /// Answers the join presence with the room's echo.
    async fn complete_join(&mut self) {
      let join = self.next_sent().await;
      assert!(join.is("presence", "jabber:client"));
      assert_eq!(join.attr("to"), Some("room@conference.example.com/recorder"));
      self.dispatcher.dispatch(&stanza(ROOM_ECHO));
    }

    /// Delivers the session-initiate and returns the id of the session-accept sent in reply.
    async fn complete_initiate(&mut self) -> String {
      self.dispatcher.dispatch(&stanza(INITIATE));

      let ack = self.next_sent().await;
      assert_eq!(ack.attr("type"), Some("result"));
      assert_eq!(ack.attr("id"), Some("init-1"));
      assert_eq!(ack.attr("to"), Some("room@conference.example.com/focus"));

      let accept = self.next_sent().await;
      let jingle = accept.get_child("jingle", ns::JINGLE).unwrap();
      assert_eq!(jingle.attr("action"), Some("session-accept"));
      assert_eq!(jingle.attr("sid"), Some("sid-1"));
      accept.attr("id").unwrap().to_owned()
    }
  }

  fn participant_presence(nick: &str, jid: &str, ssrc: u32) -> Element {
    stanza(&format!(
      "<presence xmlns='jabber:client' from='room@conference.example.com/{}' to='recorder@example.com/r'>\
        <x xmlns='http://jabber.org/protocol/muc#user'>\
          <item affiliation='none' role='participant' jid='{}'/>\
        </x>\
        <media xmlns='http://estos.de/ns/mjs'><source type='audio' ssrc='{}' direction='sendrecv'/></media>\
      </presence>",
      nick, jid, ssrc
    ))
  }

  fn config() -> SessionConfig {
    SessionConfig::new("room@conference.example.com".parse().unwrap(), "recorder")
  }

  fn result(id: &str) -> Element {
    stanza(&format!(
      "<iq xmlns='jabber:client' type='result' id='{}' from='room@conference.example.com/focus' to='recorder@example.com/r'/>",
      id
    ))
  }

  #[tokio::test]
  async fn connects_records_ssrcs_and_disconnects() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();

    harness.complete_join().await;
    let accept_id = harness.complete_initiate().await;
    assert_eq!(harness.session.state(), HandshakeState::AcceptSent);

    harness
      .dispatcher
      .dispatch(&participant_presence("alice", "alice@example.com/web", 1234));
    harness.dispatcher.dispatch(&result(&accept_id));

    let initiate = connect.await.unwrap().unwrap();
    assert_eq!(initiate.payload_type(MediaType::Audio, "opus"), Some(111));
    assert_eq!(initiate.sid, "sid-1");
    assert_eq!(harness.session.state(), HandshakeState::Established);

    let sources = harness.session.context().sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].ssrc, 1234);
    assert_eq!(sources[0].participant.to_string(), "alice@example.com/web");

    harness
      .session
      .disconnect(Reason::Success, "")
      .await
      .unwrap();
    let terminate = harness.next_sent().await;
    let jingle = terminate.get_child("jingle", ns::JINGLE).unwrap();
    assert_eq!(jingle.attr("action"), Some("session-terminate"));
    assert!(jingle
      .get_child("reason", ns::JINGLE)
      .unwrap()
      .has_child("success", ns::JINGLE));
    let leave = harness.next_sent().await;
    assert!(leave.is("presence", "jabber:client"));
    assert_eq!(leave.attr("type"), Some("unavailable"));
    assert!(harness.rx.try_recv().is_err());
    assert_eq!(harness.session.state(), HandshakeState::Terminated);

    harness
      .session
      .disconnect(Reason::Success, "")
      .await
      .unwrap();
    assert_eq!(harness.transport.sent().len(), 5);
  }

  #[tokio::test]
  async fn accept_id_matching_ignores_unrelated_results() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();
    harness.complete_join().await;
    let accept_id = harness.complete_initiate().await;

    harness.dispatcher.dispatch(&result("ping-1"));
    tokio::task::yield_now().await;
    assert_eq!(harness.session.state(), HandshakeState::AcceptSent);

    harness.dispatcher.dispatch(&result(&accept_id));
    assert!(connect.await.unwrap().is_ok());
    assert_eq!(harness.session.state(), HandshakeState::Established);
  }

  #[tokio::test]
  async fn any_result_matching_accepts_an_unrelated_result() {
    let mut harness = Harness::new(config().with_ack_matching(AckMatching::AnyResult));
    let connect = harness.spawn_connect();
    harness.complete_join().await;
    harness.complete_initiate().await;

    harness.dispatcher.dispatch(&result("ping-1"));
    assert!(connect.await.unwrap().is_ok());
    assert_eq!(harness.session.state(), HandshakeState::Established);
  }

  #[tokio::test]
  async fn error_reply_to_accept_is_a_rejection() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();
    harness.complete_join().await;
    let accept_id = harness.complete_initiate().await;

    harness.dispatcher.dispatch(&stanza(&format!(
      "<iq xmlns='jabber:client' type='error' id='{}' from='room@conference.example.com/focus'>\
        <error type='cancel'><not-acceptable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
      </iq>",
      accept_id
    )));
    match connect.await.unwrap() {
      Err(Error::AcceptRejected(condition)) => assert_eq!(condition, "not-acceptable"),
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn missing_initiate_times_out() {
    let mut harness = Harness::new(config());
    let started = Instant::now();
    let connect = harness.spawn_connect();
    harness.complete_join().await;

    match connect.await.unwrap() {
      Err(Error::HandshakeTimeout(stage)) => assert_eq!(stage, Stage::SessionInitiate),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(harness.session.state(), HandshakeState::AwaitingInitiate);

    // nothing was initiated, so leaving is all there is to do
    harness
      .session
      .disconnect(Reason::Timeout, "no initiate")
      .await
      .unwrap();
    let leave = harness.next_sent().await;
    assert_eq!(leave.attr("type"), Some("unavailable"));
    assert!(harness.rx.try_recv().is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn missing_accept_acknowledgement_times_out() {
    let mut harness = Harness::new(config().with_handshake_timeout(Duration::from_secs(5)));
    let connect = harness.spawn_connect();
    harness.complete_join().await;
    harness.complete_initiate().await;

    match connect.await.unwrap() {
      Err(Error::HandshakeTimeout(stage)) => assert_eq!(stage, Stage::SessionAcceptAck),
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn join_conflict_fails_connect() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();
    harness.next_sent().await;
    harness.dispatcher.dispatch(&stanza(
      "<presence xmlns='jabber:client' type='error' from='room@conference.example.com/recorder'>\
        <error type='cancel'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
      </presence>",
    ));

    match connect.await.unwrap() {
      Err(Error::Join(JoinError::Rejected { condition, .. })) => assert_eq!(condition, "conflict"),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(harness.session.state(), HandshakeState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_interrupts_the_initiate_wait() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();
    harness.complete_join().await;

    let cancel = harness.session.cancellation_token();
    tokio::spawn(async move {
      time::sleep(Duration::from_secs(1)).await;
      cancel.cancel();
    });

    match connect.await.unwrap() {
      Err(Error::Cancelled(stage)) => assert_eq!(stage, Stage::SessionInitiate),
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn second_connect_is_rejected() {
    let mut harness = Harness::new(config());
    let connect = harness.spawn_connect();
    harness.complete_join().await;
    let accept_id = harness.complete_initiate().await;
    harness.dispatcher.dispatch(&result(&accept_id));
    connect.await.unwrap().unwrap();

    let again = harness
      .session
      .connect(&LocalTransport::generate(), &FixedFingerprint)
      .await;
    assert!(matches!(
      again,
      Err(Error::InvalidState {
        state: HandshakeState::Established,
        ..
      })
    ));
  }

  #[tokio::test]
  async fn disconnect_before_connect_sends_nothing() {
    let mut harness = Harness::new(config());
    assert_eq!(harness.session.state(), HandshakeState::Idle);

    harness
      .session
      .disconnect(Reason::Success, "never started")
      .await
      .unwrap();
    assert_eq!(harness.session.state(), HandshakeState::Terminated);
    assert!(harness.rx.try_recv().is_err());
    assert!(harness.transport.sent().is_empty());

    harness
      .session
      .disconnect(Reason::Success, "")
      .await
      .unwrap();
    assert!(harness.transport.sent().is_empty());
  }

  #[tokio::test]
  async fn presence_before_and_during_the_handshake_is_tracked() {
    let mut harness = Harness::new(config());
    harness
      .dispatcher
      .dispatch(&participant_presence("alice", "alice@example.com/web", 1111));

    let connect = harness.spawn_connect();
    harness.complete_join().await;
    harness
      .dispatcher
      .dispatch(&participant_presence("bob", "bob@example.com/web", 2222));
    let accept_id = harness.complete_initiate().await;
    harness.dispatcher.dispatch(&result(&accept_id));
    connect.await.unwrap().unwrap();

    let ssrcs: Vec<_> = harness
      .session
      .context()
      .sources()
      .into_iter()
      .map(|source| (source.participant.to_string(), source.ssrc))
      .collect();
    assert_eq!(
      ssrcs,
      vec![
        ("alice@example.com/web".to_owned(), 1111),
        ("bob@example.com/web".to_owned(), 2222),
      ]
    );
  }
}
