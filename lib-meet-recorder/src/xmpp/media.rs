use std::convert::TryFrom;

use anyhow::{bail, Result};
use xmpp_parsers::Element;

use crate::{
  source::{MediaDirection, MediaType},
  xmpp::ns,
};

/// The `<media/>` presence extension through which Jitsi Meet participants announce, per media
/// type, the direction and SSRC of the stream they send.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPresence {
  pub sources: Vec<MediaSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
  pub media: String,
  pub ssrc: Option<u32>,
  pub direction: Option<MediaDirection>,
}

impl MediaPresence {
  /// The SSRC announced for `media_type`, if the participant is sending it.
  pub fn sending_ssrc(&self, media_type: MediaType) -> Option<u32> {
    let source = self
      .sources
      .iter()
      .find(|source| source.media == media_type.as_str())?;
    if source.direction?.is_sending() {
      source.ssrc
    }
    else {
      None
    }
  }
}

impl TryFrom<Element> for MediaPresence {
  type Error = anyhow::Error;

  fn try_from(elem: Element) -> Result<MediaPresence> {
    if !elem.is("media", ns::JITSI_MEDIA) {
      bail!("not a media element");
    }
    Ok(MediaPresence {
      sources: elem
        .children()
        .filter(|child| child.is("source", ns::JITSI_MEDIA))
        .filter_map(|child| {
          Some(MediaSource {
            media: child.attr("type")?.to_owned(),
            ssrc: child.attr("ssrc").and_then(|ssrc| ssrc.parse().ok()),
            direction: child
              .attr("direction")
              .and_then(|direction| direction.parse().ok()),
          })
        })
        .collect(),
    })
  }
}

impl From<MediaPresence> for Element {
  fn from(media: MediaPresence) -> Element {
    Element::builder("media", ns::JITSI_MEDIA)
      .append_all(media.sources.into_iter().map(|source| {
        Element::builder("source", ns::JITSI_MEDIA)
          .attr("type", source.media)
          .attr("ssrc", source.ssrc.map(|ssrc| ssrc.to_string()))
          .attr("direction", source.direction.map(|direction| direction.as_str()))
          .build()
      }))
      .build()
  }
}
