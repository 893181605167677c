use std::{fmt, str::FromStr};

use anyhow::bail;
use xmpp_parsers::FullJid;

/// A remote media source, attributed to the participant that is sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
  pub ssrc: u32,
  pub participant: FullJid,
  pub media_type: MediaType,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MediaType {
  Audio,
  Video,
}

impl MediaType {
  /// Every recognised media type, in the order content blocks are emitted.
  pub const ALL: [MediaType; 2] = [MediaType::Audio, MediaType::Video];

  pub fn as_str(&self) -> &'static str {
    match self {
      MediaType::Audio => "audio",
      MediaType::Video => "video",
    }
  }

  pub(crate) fn default_clock_rate(&self) -> u32 {
    match self {
      MediaType::Audio => 48000,
      MediaType::Video => 90000,
    }
  }
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MediaType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "audio" => Ok(MediaType::Audio),
      "video" => Ok(MediaType::Video),
      other => bail!("unsupported media type: {}", other),
    }
  }
}

/// SDP-style direction of a participant's media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
  SendRecv,
  SendOnly,
  RecvOnly,
  Inactive,
}

impl MediaDirection {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaDirection::SendRecv => "sendrecv",
      MediaDirection::SendOnly => "sendonly",
      MediaDirection::RecvOnly => "recvonly",
      MediaDirection::Inactive => "inactive",
    }
  }

  /// Whether the participant is producing media in this direction.
  pub fn is_sending(&self) -> bool {
    matches!(self, MediaDirection::SendRecv | MediaDirection::SendOnly)
  }
}

impl FromStr for MediaDirection {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "sendrecv" => Ok(MediaDirection::SendRecv),
      "sendonly" => Ok(MediaDirection::SendOnly),
      "recvonly" => Ok(MediaDirection::RecvOnly),
      "inactive" => Ok(MediaDirection::Inactive),
      other => bail!("invalid media direction: {}", other),
    }
  }
}
