use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use lib_meet_recorder::{
  init_tracing, AckMatching, Authentication, Connection, DtlsCertificate, LocalTransport,
  MediaType, Reason, RecordingSession, SessionConfig, StanzaDispatcher, StaticCatalog,
};
use structopt::StructOpt;
use tokio::{signal::ctrl_c, time};
use tracing::{error, info};
use xmpp_parsers::BareJid;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
  name = "meet-recorder",
  about = "Negotiate a recording session with a Jitsi Meet conference."
)]
struct Opt {
  #[structopt(long)]
  web_socket_url: String,
  #[structopt(long)]
  xmpp_domain: String,
  #[structopt(long)]
  room_name: String,
  #[structopt(long)]
  muc_domain: Option<String>,
  #[structopt(long, default_value = "meet-recorder")]
  nick: String,
  #[structopt(long)]
  xmpp_username: Option<String>,
  #[structopt(long)]
  xmpp_password: Option<String>,
  /// Treat any IQ result received after the session-accept as its acknowledgement.
  #[structopt(long)]
  loose_ack: bool,
  #[structopt(long, default_value = "20")]
  handshake_timeout: u64,
  /// Seconds between logs of the participant SSRCs.
  #[structopt(long, default_value = "10")]
  source_log_interval: u64,
  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();

  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let authentication = match (opt.xmpp_username.clone(), opt.xmpp_password.clone()) {
    (Some(username), Some(password)) => Authentication::Plain { username, password },
    (None, None) => Authentication::Anonymous,
    _ => bail!("--xmpp-username and --xmpp-password must be given together"),
  };

  let dispatcher = Arc::new(StanzaDispatcher::new());
  let (connection, background) = Connection::new(
    &opt.web_socket_url,
    &opt.xmpp_domain,
    authentication,
    dispatcher.clone(),
  )
  .await
  .context("failed to connect")?;

  tokio::spawn(background);

  connection.connect().await?;

  let room: BareJid = format!(
    "{}@{}",
    opt.room_name,
    opt
      .muc_domain
      .clone()
      .unwrap_or_else(|| format!("conference.{}", opt.xmpp_domain)),
  )
  .parse()
  .context("invalid room JID")?;

  let config = SessionConfig::new(room, opt.nick.clone())
    .with_handshake_timeout(Duration::from_secs(opt.handshake_timeout))
    .with_ack_matching(if opt.loose_ack {
      AckMatching::AnyResult
    }
    else {
      AckMatching::AcceptId
    });

  let certificate = DtlsCertificate::generate()?;
  info!("DTLS fingerprint: {}", certificate.fingerprint());
  let transport = LocalTransport::generate();

  let session = RecordingSession::new(
    config,
    Arc::new(connection),
    dispatcher,
    Arc::new(StaticCatalog::default()),
  );

  let cancel = session.cancellation_token();
  tokio::spawn(async move {
    if ctrl_c().await.is_ok() {
      info!("interrupted, disconnecting");
      cancel.cancel();
    }
  });

  let connected = session.connect(&transport, &certificate).await;
  match &connected {
    Ok(initiate) => {
      for media_type in MediaType::ALL {
        if let Some(codecs) = initiate.codecs.get(&media_type) {
          for codec in codecs {
            info!(
              "{} codec: {} (pt {}, {} Hz)",
              media_type, codec.name, codec.payload_type, codec.clock_rate
            );
          }
        }
      }

      let cancel = session.cancellation_token();
      let mut interval = time::interval(Duration::from_secs(opt.source_log_interval.max(1)));
      loop {
        tokio::select! {
          _ = interval.tick() => {
            for source in session.context().sources() {
              info!("{} {}: ssrc {}", source.participant, source.media_type, source.ssrc);
            }
          },
          _ = cancel.cancelled() => break,
        }
      }
    },
    Err(e) => error!("failed to establish recording session: {}", e),
  }

  let reason = if connected.is_ok() {
    Reason::Success
  }
  else {
    Reason::GeneralError
  };
  session.disconnect(reason, "").await?;
  connected?;
  Ok(())
}
