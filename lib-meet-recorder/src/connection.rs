use std::{convert::TryFrom, fmt, future::Future, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{
  sink::{Sink, SinkExt},
  stream::{Stream, StreamExt, TryStreamExt},
};
use rand::{thread_rng, RngCore};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{
  http::{Request, Uri},
  Message,
};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
  bind::{BindQuery, BindResponse},
  iq::{Iq, IqType},
  sasl::{Auth, Mechanism, Success},
  websocket::Open,
  BareJid, Element, FullJid,
};

use crate::{
  dispatcher::StanzaDispatcher, pinger::Pinger, transport::Transport, util::generate_id,
};

#[derive(Debug, Clone, Copy)]
enum ConnectionState {
  OpeningPreAuthentication,
  ReceivingFeaturesPreAuthentication,
  Authenticating,
  OpeningPostAuthentication,
  ReceivingFeaturesPostAuthentication,
  Binding,
  Idle,
}

struct ConnectionInner {
  state: ConnectionState,
  jid: Option<FullJid>,
  xmpp_domain: BareJid,
  authentication: Authentication,
  connected_tx: Option<oneshot::Sender<Result<()>>>,
}

impl fmt::Debug for ConnectionInner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionInner")
      .field("state", &self.state)
      .field("jid", &self.jid)
      .finish()
  }
}

/// An XMPP client connection over WebSocket (RFC 7395).
///
/// Once bound, every inbound stanza is handed to the [`StanzaDispatcher`] in arrival order.
#[derive(Debug, Clone)]
pub struct Connection {
  tx: mpsc::Sender<Element>,
  inner: Arc<Mutex<ConnectionInner>>,
  dispatcher: Arc<StanzaDispatcher>,
}

#[derive(Debug, Clone)]
pub enum Authentication {
  Anonymous,
  Plain { username: String, password: String },
}

impl Authentication {
  fn auth(&self) -> Auth {
    match self {
      Authentication::Anonymous => Auth {
        mechanism: Mechanism::Anonymous,
        data: vec![],
      },
      Authentication::Plain { username, password } => {
        let mut data = Vec::with_capacity(username.len() + password.len() + 2);
        data.push(0u8);
        data.extend_from_slice(username.as_bytes());
        data.push(0u8);
        data.extend_from_slice(password.as_bytes());
        Auth {
          mechanism: Mechanism::Plain,
          data,
        }
      },
    }
  }
}

impl Connection {
  /// Opens the WebSocket. The returned future drives the connection and must be spawned; it
  /// completes when the connection fails or is closed.
  pub async fn new(
    websocket_url: &str,
    xmpp_domain: &str,
    authentication: Authentication,
    dispatcher: Arc<StanzaDispatcher>,
  ) -> Result<(Self, impl Future<Output = ()>)> {
    let websocket_url: Uri = websocket_url.parse().context("invalid WebSocket URL")?;
    let xmpp_domain: BareJid = xmpp_domain.parse().context("invalid XMPP domain")?;

    info!("Connecting XMPP WebSocket to {}", websocket_url);
    let mut key = [0u8; 16];
    thread_rng().fill_bytes(&mut key);
    let request = Request::get(&websocket_url)
      .header("sec-websocket-protocol", "xmpp")
      .header("sec-websocket-key", BASE64.encode(key))
      .header("sec-websocket-version", "13")
      .header(
        "host",
        websocket_url
          .host()
          .context("invalid WebSocket URL: missing host")?,
      )
      .header("connection", "Upgrade")
      .header("upgrade", "websocket")
      .body(())
      .context("failed to build WebSocket request")?;
    let (websocket, _response) = tokio_tungstenite::connect_async(request)
      .await
      .context("failed to connect XMPP WebSocket")?;
    let (sink, stream) = websocket.split();
    let (tx, rx) = mpsc::channel(64);

    let inner = Arc::new(Mutex::new(ConnectionInner {
      state: ConnectionState::OpeningPreAuthentication,
      jid: None,
      xmpp_domain,
      authentication,
      connected_tx: None,
    }));

    let connection = Self {
      tx: tx.clone(),
      inner: inner.clone(),
      dispatcher: dispatcher.clone(),
    };

    let writer = Connection::write_loop(rx, sink);
    let reader = Connection::read_loop(inner, tx, dispatcher, stream);

    let background = async move {
      tokio::select! {
        res = reader => if let Err(e) = res { error!("fatal (in read loop): {:?}", e) },
        res = writer => if let Err(e) = res { error!("fatal (in write loop): {:?}", e) },
      }
    };

    Ok((connection, background))
  }

  /// Negotiates the XMPP stream up to resource binding.
  #[tracing::instrument(level = "debug", skip(self), err)]
  pub async fn connect(&self) -> Result<()> {
    let (tx, rx) = oneshot::channel();

    {
      let mut locked_inner = self.inner.lock().await;
      locked_inner.connected_tx = Some(tx);
      let open = Open::new(locked_inner.xmpp_domain.clone());
      self.tx.send(open.into()).await?;
    }

    rx.await?
  }

  pub async fn jid(&self) -> Option<FullJid> {
    let locked_inner = self.inner.lock().await;
    locked_inner.jid.clone()
  }

  pub fn dispatcher(&self) -> &Arc<StanzaDispatcher> {
    &self.dispatcher
  }

  async fn write_loop<S>(rx: mpsc::Receiver<Element>, mut sink: S) -> Result<()>
  where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
  {
    let mut rx = ReceiverStream::new(rx);
    while let Some(element) = rx.next().await {
      let mut bytes = Vec::new();
      element.write_to(&mut bytes)?;
      let xml = String::from_utf8(bytes)?;
      debug!("XMPP    >>> {}", xml);
      sink.send(Message::Text(xml)).await?;
    }
    Ok(())
  }

  async fn read_loop<S>(
    inner: Arc<Mutex<ConnectionInner>>,
    tx: mpsc::Sender<Element>,
    dispatcher: Arc<StanzaDispatcher>,
    mut stream: S,
  ) -> Result<()>
  where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
  {
    loop {
      let message = stream
        .try_next()
        .await?
        .ok_or_else(|| anyhow!("unexpected EOF"))?;
      let element: Element = match message {
        Message::Text(xml) => {
          debug!("XMPP    <<< {}", xml);
          xml.parse()?
        },
        Message::Close(frame) => bail!("XMPP WebSocket closed: {:?}", frame),
        _ => {
          warn!(
            "unexpected non-text message on XMPP WebSocket stream: {:?}",
            message
          );
          continue;
        },
      };

      let mut locked_inner = inner.lock().await;

      use ConnectionState::*;
      match locked_inner.state {
        OpeningPreAuthentication => {
          Open::try_from(element)?;
          info!("Connected XMPP WebSocket");
          locked_inner.state = ReceivingFeaturesPreAuthentication;
        },
        ReceivingFeaturesPreAuthentication => {
          tx.send(locked_inner.authentication.auth().into()).await?;
          locked_inner.state = Authenticating;
        },
        Authenticating => {
          if let Err(e) = Success::try_from(element) {
            let e = anyhow!("authentication failed: {}", e);
            if let Some(connected_tx) = locked_inner.connected_tx.take() {
              let _ = connected_tx.send(Err(anyhow!("{}", e)));
            }
            return Err(e);
          }

          let open = Open::new(locked_inner.xmpp_domain.clone());
          tx.send(open.into()).await?;
          locked_inner.state = OpeningPostAuthentication;
        },
        OpeningPostAuthentication => {
          Open::try_from(element)?;
          match &locked_inner.authentication {
            Authentication::Anonymous => info!("Logged in anonymously"),
            Authentication::Plain { .. } => info!("Logged in with PLAIN"),
          }
          locked_inner.state = ReceivingFeaturesPostAuthentication;
        },
        ReceivingFeaturesPostAuthentication => {
          let iq = Iq::from_set(generate_id(), BindQuery::new(None));
          tx.send(iq.into()).await?;
          locked_inner.state = Binding;
        },
        Binding => match Iq::try_from(element) {
          Ok(iq) => {
            let jid = if let IqType::Result(Some(element)) = iq.payload {
              let bind = BindResponse::try_from(element)?;
              FullJid::try_from(bind)?
            }
            else {
              bail!("bind failed");
            };
            info!("My JID: {}", jid);
            locked_inner.jid = Some(jid.clone());

            dispatcher.add_stanza_filter(Pinger::new(jid, Arc::new(tx.clone())));

            if let Some(connected_tx) = locked_inner.connected_tx.take() {
              connected_tx
                .send(Ok(()))
                .map_err(|_| anyhow!("channel closed"))?;
            }
            locked_inner.state = Idle;
          },
          Err(e) => debug!(
            "received unexpected element while waiting for bind response: {}",
            e
          ),
        },
        Idle => {
          drop(locked_inner);
          dispatcher.dispatch(&element);
        },
      }
    }
  }
}

#[async_trait]
impl Transport for Connection {
  async fn send(&self, element: Element) -> Result<()> {
    self
      .tx
      .send(element)
      .await
      .map_err(|_| anyhow!("XMPP connection closed"))
  }
}
