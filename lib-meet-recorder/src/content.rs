use tracing::{debug, warn};
use xmpp_parsers::{
  hashes::Algo,
  jingle::{Action, Content, Creator, Description, Jingle, Senders, SessionId},
  jingle_dtls_srtp::{Fingerprint, Setup},
  jingle_ice_udp::Transport as IceUdpTransport,
  jingle_rtp::{self, Description as RtpDescription, PayloadType, RtcpMux},
  jingle_ssma::{self, Parameter},
};

use crate::{
  context::SessionContext,
  error::{Error, Result},
  source::MediaType,
  util::random_token,
};

/// The digest of the local DTLS certificate, as carried in a Jingle `<fingerprint/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFingerprint {
  pub hash: Algo,
  pub value: Vec<u8>,
}

/// Supplies the fingerprint of the certificate the DTLS layer will present for a content.
pub trait FingerprintProvider: Send + Sync {
  fn local_fingerprint(&self, media_type: MediaType) -> LocalFingerprint;
}

/// Supplies the ICE transport description to attach to a content.
pub trait TransportManager: Send + Sync {
  fn transport(&self, media_type: MediaType) -> IceUdpTransport;
}

/// ICE credentials for a transport that has no gathered candidates of its own.
#[derive(Debug, Clone)]
pub struct LocalTransport {
  pub ufrag: String,
  pub pwd: String,
}

impl LocalTransport {
  pub fn generate() -> Self {
    Self {
      ufrag: random_token(8),
      pwd: random_token(24),
    }
  }
}

impl TransportManager for LocalTransport {
  fn transport(&self, _media_type: MediaType) -> IceUdpTransport {
    let mut transport = IceUdpTransport::new();
    transport.ufrag = Some(self.ufrag.clone());
    transport.pwd = Some(self.pwd.clone());
    transport
  }
}

/// The RTP description of `content`, if it has one.
pub(crate) fn rtp_description(content: &Content) -> Option<&RtpDescription> {
  match &content.description {
    Some(Description::Rtp(description)) => Some(description),
    _ => None,
  }
}

/// The content of `jingle` whose RTP description is for `media_type`.
pub fn media_content(
  jingle: &Jingle,
  media_type: MediaType,
) -> Option<(&Content, &RtpDescription)> {
  jingle.contents.iter().find_map(|content| {
    let description = rtp_description(content)?;
    if description.media == media_type.as_str() {
      Some((content, description))
    }
    else {
      None
    }
  })
}

/// Sets the transport's fingerprint, updating the existing element in place if there is one.
pub(crate) fn attach_fingerprint(transport: &mut IceUdpTransport, fingerprint: LocalFingerprint) {
  match transport.fingerprint.as_mut() {
    Some(existing) => {
      existing.hash = fingerprint.hash;
      existing.value = fingerprint.value;
    },
    None => {
      transport.fingerprint = Some(Fingerprint {
        hash: fingerprint.hash,
        setup: Setup::Active,
        value: fingerprint.value,
        required: Some(true.to_string()),
      });
    },
  }
}

/// Builds the session-accept answering `offer`.
///
/// One content is emitted per recognised media type the offer contains, in [`MediaType::ALL`]
/// order, using the codecs recorded in `context` when the initiate was received.
pub fn build_accept(
  context: &SessionContext,
  offer: &Jingle,
  transports: &dyn TransportManager,
  fingerprints: &dyn FingerprintProvider,
  cname: &str,
) -> Result<Jingle> {
  let identity = context.identity().ok_or(Error::NotInitiated {
    operation: "build session-accept",
  })?;

  for content in &offer.contents {
    let media = rtp_description(content).map(|description| description.media.as_str());
    if media.and_then(|media| media.parse::<MediaType>().ok()).is_none() {
      debug!("ignoring offered content {} ({:?})", content.name.0, media);
    }
  }

  let mut accept = Jingle::new(Action::SessionAccept, SessionId(identity.sid))
    .with_initiator(offer.initiator.clone().unwrap_or(identity.remote))
    .with_responder(identity.local);

  for media_type in MediaType::ALL {
    let offered = match media_content(offer, media_type) {
      Some((offered, _)) => offered,
      None => continue,
    };

    let mut description = RtpDescription::new(media_type.as_str().to_owned());

    description.payload_types = context
      .codecs(media_type)
      .into_iter()
      .map(|codec| {
        let mut payload_type = PayloadType::new(
          codec.payload_type,
          codec.name,
          codec.clock_rate,
          codec.channels.unwrap_or(1),
        );
        payload_type.parameters = codec
          .parameters
          .into_iter()
          .map(|(name, value)| jingle_rtp::Parameter { name, value })
          .collect();
        payload_type
      })
      .collect();
    if description.payload_types.is_empty() {
      warn!("no {} codecs in common with the offer", media_type);
    }

    description.rtcp_mux = Some(RtcpMux);

    let ssrc = context.local_ssrc(media_type).to_string();
    let mut source = jingle_ssma::Source::new(context.local_ssrc(media_type));
    source.parameters.push(Parameter {
      name: "cname".to_owned(),
      value: Some(cname.to_owned()),
    });
    source.parameters.push(Parameter {
      name: "msid".to_owned(),
      value: Some(context.msid(media_type)),
    });
    source.parameters.push(Parameter {
      name: "mslabel".to_owned(),
      value: Some(context.mslabel().to_owned()),
    });
    source.parameters.push(Parameter {
      name: "label".to_owned(),
      value: Some(context.label(media_type).to_owned()),
    });
    description.ssrc = Some(ssrc);
    description.ssrcs = vec![source];

    let mut transport = transports.transport(media_type);
    attach_fingerprint(&mut transport, fingerprints.local_fingerprint(media_type));

    accept = accept.add_content(
      Content::new(Creator::Responder, offered.name.clone())
        .with_senders(Senders::Initiator)
        .with_description(description)
        .with_transport(transport),
    );
  }

  Ok(accept)
}
