use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use rand::random;
use tracing::debug;
use xmpp_parsers::{BareJid, FullJid, Jid};

use crate::{
  catalog::Codec,
  error::{Error, Result},
  source::{MediaType, Source},
  util::generate_id,
};

/// Identity of a Jingle session, fixed by the session-initiate that opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
  pub sid: String,
  pub local: Jid,
  pub remote: Jid,
}

#[derive(Debug, Default)]
struct Inner {
  identity: Option<SessionIdentity>,
  codecs: BTreeMap<MediaType, Vec<Codec>>,
  participants: HashMap<FullJid, HashMap<MediaType, u32>>,
}

/// State shared by the handshake and the presence tracker for the lifetime of one session.
///
/// The local SSRCs and stream labels are chosen at construction and never change. The session
/// identity and codecs are written once, when the session-initiate is accepted; participant SSRCs
/// are only ever inserted or overwritten.
#[derive(Debug)]
pub struct SessionContext {
  room: BareJid,
  local_ssrcs: HashMap<MediaType, u32>,
  mslabel: String,
  labels: HashMap<MediaType, String>,
  inner: Mutex<Inner>,
}

impl SessionContext {
  pub fn new(room: BareJid) -> Self {
    let audio_ssrc = random::<u32>();
    let video_ssrc = loop {
      let ssrc = random::<u32>();
      if ssrc != audio_ssrc {
        break ssrc;
      }
    };
    Self {
      room,
      local_ssrcs: MediaType::ALL.iter().copied().zip([audio_ssrc, video_ssrc]).collect(),
      mslabel: generate_id(),
      labels: MediaType::ALL
        .iter()
        .map(|media_type| (*media_type, generate_id()))
        .collect(),
      inner: Mutex::new(Inner::default()),
    }
  }

  pub fn room(&self) -> &BareJid {
    &self.room
  }

  pub(crate) fn record_initiate(
    &self,
    identity: SessionIdentity,
    codecs: BTreeMap<MediaType, Vec<Codec>>,
  ) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.identity.is_some() {
      return Err(Error::AlreadyInitiated);
    }
    debug!("session {} between {} and {}", identity.sid, identity.local, identity.remote);
    inner.identity = Some(identity);
    inner.codecs = codecs;
    Ok(())
  }

  pub fn identity(&self) -> Option<SessionIdentity> {
    self.inner.lock().identity.clone()
  }

  pub fn sid(&self) -> Option<String> {
    self.inner.lock().identity.as_ref().map(|identity| identity.sid.clone())
  }

  pub fn local_jid(&self) -> Option<Jid> {
    self.inner.lock().identity.as_ref().map(|identity| identity.local.clone())
  }

  pub fn remote_jid(&self) -> Option<Jid> {
    self.inner.lock().identity.as_ref().map(|identity| identity.remote.clone())
  }

  pub fn codecs(&self, media_type: MediaType) -> Vec<Codec> {
    self
      .inner
      .lock()
      .codecs
      .get(&media_type)
      .cloned()
      .unwrap_or_default()
  }

  /// Codec name to payload type, in negotiated order.
  pub fn payload_types(&self, media_type: MediaType) -> Vec<(String, u8)> {
    self
      .codecs(media_type)
      .into_iter()
      .map(|codec| (codec.name, codec.payload_type))
      .collect()
  }

  pub fn local_ssrc(&self, media_type: MediaType) -> u32 {
    self.local_ssrcs[&media_type]
  }

  pub fn mslabel(&self) -> &str {
    &self.mslabel
  }

  pub fn label(&self, media_type: MediaType) -> &str {
    &self.labels[&media_type]
  }

  /// The WebRTC media stream id of the local track for `media_type`.
  pub fn msid(&self, media_type: MediaType) -> String {
    format!("{} {}", self.mslabel, self.label(media_type))
  }

  pub(crate) fn set_participant_ssrc(&self, participant: FullJid, media_type: MediaType, ssrc: u32) {
    let mut inner = self.inner.lock();
    let previous = inner
      .participants
      .entry(participant.clone())
      .or_default()
      .insert(media_type, ssrc);
    if previous != Some(ssrc) {
      debug!("{} {} ssrc: {:?} -> {}", participant, media_type, previous, ssrc);
    }
  }

  pub fn participant_ssrcs(&self, participant: &FullJid) -> Option<HashMap<MediaType, u32>> {
    self.inner.lock().participants.get(participant).cloned()
  }

  pub fn participants(&self) -> HashMap<FullJid, HashMap<MediaType, u32>> {
    self.inner.lock().participants.clone()
  }

  /// Every known participant SSRC, ordered by participant then media type.
  pub fn sources(&self) -> Vec<Source> {
    let inner = self.inner.lock();
    let mut sources: Vec<_> = inner
      .participants
      .iter()
      .flat_map(|(participant, ssrcs)| {
        ssrcs.iter().map(move |(media_type, ssrc)| Source {
          ssrc: *ssrc,
          participant: participant.clone(),
          media_type: *media_type,
        })
      })
      .collect();
    sources.sort_by(|a, b| {
      (a.participant.to_string(), a.media_type).cmp(&(b.participant.to_string(), b.media_type))
    });
    sources
  }
}

#[cfg(test)]
mod tests {
  use maplit::btreemap;

  use super::*;

  fn context() -> SessionContext {
    SessionContext::new("room@conference.example.com".parse().unwrap())
  }

  fn identity(sid: &str) -> SessionIdentity {
    SessionIdentity {
      sid: sid.into(),
      local: "recorder@example.com/r".parse().unwrap(),
      remote: "room@conference.example.com/focus".parse().unwrap(),
    }
  }

  fn opus() -> Codec {
    Codec {
      name: "opus".into(),
      payload_type: 111,
      clock_rate: 48000,
      channels: Some(2),
      parameters: vec![],
    }
  }

  #[test]
  fn session_identity_is_set_at_most_once() {
    let context = context();
    assert!(context.sid().is_none());

    context
      .record_initiate(identity("first"), btreemap! { MediaType::Audio => vec![opus()] })
      .unwrap();
    assert!(matches!(
      context.record_initiate(identity("second"), BTreeMap::new()),
      Err(Error::AlreadyInitiated)
    ));

    assert_eq!(context.sid().as_deref(), Some("first"));
    assert_eq!(context.payload_types(MediaType::Audio), vec![("opus".to_owned(), 111)]);
    assert!(context.payload_types(MediaType::Video).is_empty());
  }

  #[test]
  fn local_streams_are_distinct_per_media_type() {
    let context = context();
    assert_ne!(
      context.local_ssrc(MediaType::Audio),
      context.local_ssrc(MediaType::Video)
    );
    assert_ne!(context.label(MediaType::Audio), context.label(MediaType::Video));
    assert_eq!(
      context.msid(MediaType::Video),
      format!("{} {}", context.mslabel(), context.label(MediaType::Video))
    );
  }

  #[test]
  fn participant_ssrcs_are_inserted_and_overwritten() {
    let context = context();
    let alice: FullJid = "room@conference.example.com/alice".parse().unwrap();
    let bob: FullJid = "room@conference.example.com/bob".parse().unwrap();

    context.set_participant_ssrc(bob.clone(), MediaType::Video, 7);
    context.set_participant_ssrc(alice.clone(), MediaType::Audio, 1);
    context.set_participant_ssrc(alice.clone(), MediaType::Audio, 2);

    assert_eq!(context.participant_ssrcs(&alice).unwrap()[&MediaType::Audio], 2);
    assert_eq!(context.participants().len(), 2);
    let sources: Vec<_> = context
      .sources()
      .into_iter()
      .map(|source| (source.participant.resource, source.ssrc))
      .collect();
    assert_eq!(sources, vec![("alice".to_owned(), 2), ("bob".to_owned(), 7)]);
  }
}
