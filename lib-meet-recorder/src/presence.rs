use std::{convert::TryFrom, sync::Arc};

use anyhow::{Context, Result};
use tracing::trace;
use xmpp_parsers::{muc::MucUser, ns, Element};

use crate::{
  context::SessionContext,
  source::MediaType,
  stanza_filter::StanzaFilter,
  xmpp::{self, media::MediaPresence},
};

/// Records which SSRC each participant sends per media type, from the media extension carried
/// in their room presence.
pub(crate) struct PresenceTracker {
  context: Arc<SessionContext>,
}

impl PresenceTracker {
  pub(crate) fn new(context: Arc<SessionContext>) -> Self {
    Self { context }
  }

  fn track(&self, element: &Element) -> Result<()> {
    let muc_user = element
      .get_child("x", ns::MUC_USER)
      .context("no MUC user extension")?;
    let participant = MucUser::try_from(muc_user.clone())?
      .items
      .into_iter()
      .find_map(|item| item.jid)
      .context("real JID not disclosed")?;
    let media = element
      .get_child("media", xmpp::ns::JITSI_MEDIA)
      .context("no media extension")?;
    let media = MediaPresence::try_from(media.clone())?;

    for media_type in MediaType::ALL {
      if let Some(ssrc) = media.sending_ssrc(media_type) {
        self
          .context
          .set_participant_ssrc(participant.clone(), media_type, ssrc);
      }
    }
    Ok(())
  }
}

impl StanzaFilter for PresenceTracker {
  fn filter(&self, element: &Element) -> bool {
    element.is("presence", xmpp::ns::CLIENT)
  }

  fn take(&self, element: &Element) {
    if let Err(e) = self.track(element) {
      trace!("presence from {:?} not tracked: {}", element.attr("from"), e);
    }
  }
}
