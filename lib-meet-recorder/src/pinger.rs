use std::{convert::TryFrom, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use tokio::{task::JoinHandle, time};
use tracing::warn;
use xmpp_parsers::{iq::Iq, ns, ping::Ping, Element, FullJid, Jid};

use crate::{stanza_filter::StanzaFilter, transport::Transport, util::generate_id, xmpp};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Keeps the XMPP connection alive: pings the server periodically and answers its pings.
pub(crate) struct Pinger {
  jid: FullJid,
  transport: Arc<dyn Transport>,
  ping_task: JoinHandle<()>,
}

impl Pinger {
  pub(crate) fn new(jid: FullJid, transport: Arc<dyn Transport>) -> Pinger {
    let ping_transport = transport.clone();
    let from = Jid::Full(jid.clone());
    let ping_task = tokio::spawn(async move {
      let mut interval = time::interval(PING_INTERVAL);
      loop {
        interval.tick().await;
        let ping = Iq::from_get(generate_id(), Ping).with_from(from.clone());
        if let Err(e) = ping_transport.send(ping.into()).await {
          warn!("failed to send XMPP ping: {:?}", e);
        }
      }
    });
    Pinger {
      jid,
      transport,
      ping_task,
    }
  }

  fn pong(&self, element: &Element) -> Result<Iq> {
    let iq = Iq::try_from(element.clone())?;
    Ok(
      Iq::empty_result(iq.from.ok_or_else(|| anyhow!("iq missing from"))?, iq.id)
        .with_from(Jid::Full(self.jid.clone())),
    )
  }
}

impl Drop for Pinger {
  fn drop(&mut self) {
    self.ping_task.abort();
  }
}

impl StanzaFilter for Pinger {
  #[tracing::instrument(level = "trace", skip(self))]
  fn filter(&self, element: &Element) -> bool {
    element.is("iq", xmpp::ns::CLIENT)
      && element.attr("type") == Some("get")
      && element.has_child("ping", ns::PING)
  }

  fn take(&self, element: &Element) {
    let pong = match self.pong(element) {
      Ok(pong) => pong,
      Err(e) => {
        warn!("ignoring malformed ping: {:?}", e);
        return;
      },
    };
    let transport = self.transport.clone();
    tokio::spawn(async move {
      if let Err(e) = transport.send(pong.into()).await {
        warn!("failed to answer XMPP ping: {:?}", e);
      }
    });
  }
}
