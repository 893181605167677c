pub mod catalog;
pub mod connection;
pub mod content;
pub mod context;
pub mod dispatcher;
pub mod dtls;
pub mod error;
pub mod jingle;
mod muc;
mod pinger;
mod presence;
pub mod session;
pub mod source;
pub mod stanza_filter;
pub mod transport;
mod util;
mod wait;
pub mod xmpp;

pub use crate::{
  catalog::{Codec, MediaCatalog, StaticCatalog},
  connection::{Authentication, Connection},
  content::{
    build_accept, media_content, FingerprintProvider, LocalFingerprint, LocalTransport,
    TransportManager,
  },
  context::{SessionContext, SessionIdentity},
  dispatcher::{StanzaDispatcher, SubscriptionId},
  dtls::DtlsCertificate,
  error::{Error, JoinError, Result},
  jingle::{AckMatching, HandshakeState, SessionInitiate},
  session::{RecordingSession, SessionConfig},
  source::{MediaDirection, MediaType, Source},
  stanza_filter::StanzaFilter,
  transport::Transport,
  wait::Stage,
};
pub use xmpp_parsers::jingle::Reason;

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
