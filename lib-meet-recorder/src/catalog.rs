use std::collections::HashMap;

use itertools::Itertools;
use maplit::hashmap;
use once_cell::sync::Lazy;
use tracing::debug;

use xmpp_parsers::jingle_rtp::PayloadType;

use crate::{source::MediaType, util::random_token};

static DEFAULT_CODECS: Lazy<HashMap<MediaType, Vec<&'static str>>> = Lazy::new(|| {
  hashmap! {
    MediaType::Audio => vec!["opus"],
    MediaType::Video => vec!["VP8", "VP9", "H264"],
  }
});

/// A codec agreed for the session, with its payload type as assigned by the offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
  pub name: String,
  pub payload_type: u8,
  pub clock_rate: u32,
  /// Only meaningful for audio.
  pub channels: Option<u8>,
  pub parameters: Vec<(String, String)>,
}

/// The media subsystem's view of which offered codecs it can record.
pub trait MediaCatalog: Send + Sync {
  /// Intersects the offered payload types for `media_type` with the locally supported codecs.
  /// The result keeps the order of the offer.
  fn negotiate(&self, media_type: MediaType, offered: &[PayloadType]) -> Vec<Codec>;

  /// The RTCP CNAME the local media streams are sent under.
  fn rtp_cname(&self) -> String;
}

/// A fixed list of supported codec names per media type.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
  supported: HashMap<MediaType, Vec<String>>,
  cname: String,
}

impl Default for StaticCatalog {
  fn default() -> Self {
    Self::new(
      DEFAULT_CODECS
        .iter()
        .map(|(media_type, names)| {
          (
            *media_type,
            names.iter().map(|name| name.to_string()).collect(),
          )
        })
        .collect(),
    )
  }
}

impl StaticCatalog {
  pub fn new(supported: HashMap<MediaType, Vec<String>>) -> Self {
    Self {
      supported,
      cname: random_token(16),
    }
  }

  pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
    self.cname = cname.into();
    self
  }

  fn supports(&self, media_type: MediaType, name: &str) -> bool {
    self
      .supported
      .get(&media_type)
      .map(|names| names.iter().any(|supported| supported.eq_ignore_ascii_case(name)))
      .unwrap_or(false)
  }
}

impl MediaCatalog for StaticCatalog {
  fn negotiate(&self, media_type: MediaType, offered: &[PayloadType]) -> Vec<Codec> {
    offered
      .iter()
      .filter_map(|payload_type| {
        let name = payload_type.name.as_deref()?;
        if !self.supports(media_type, name) {
          debug!("not recording {} codec {} (pt {})", media_type, name, payload_type.id);
          return None;
        }
        Some(Codec {
          name: name.to_owned(),
          payload_type: payload_type.id,
          clock_rate: payload_type
            .clockrate
            .unwrap_or_else(|| media_type.default_clock_rate()),
          channels: match media_type {
            MediaType::Audio => Some(payload_type.channels.0),
            MediaType::Video => None,
          },
          parameters: payload_type
            .parameters
            .iter()
            .map(|parameter| (parameter.name.clone(), parameter.value.clone()))
            .collect(),
        })
      })
      .unique_by(|codec| codec.payload_type)
      .collect()
  }

  fn rtp_cname(&self) -> String {
    self.cname.clone()
  }
}
