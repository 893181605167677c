use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use xmpp_parsers::Element;

/// Outbound half of the signalling connection. Sends are immediate and independent; nothing
/// above this trait buffers or retries.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, element: Element) -> Result<()>;
}

#[async_trait]
impl Transport for mpsc::Sender<Element> {
  async fn send(&self, element: Element) -> Result<()> {
    mpsc::Sender::send(self, element)
      .await
      .map_err(|_| anyhow!("transport channel closed"))
  }
}
