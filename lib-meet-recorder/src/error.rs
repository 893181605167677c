use std::time::Duration;

use thiserror::Error;

use crate::{jingle::HandshakeState, wait::Stage};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum JoinError {
  #[error("room rejected join: {condition}")]
  Rejected {
    condition: String,
    text: Option<String>,
  },
  #[error("room did not confirm join within {0:?}")]
  Timeout(Duration),
  #[error("join cancelled")]
  Cancelled,
  #[error("transport unavailable")]
  Transport(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("failed to join room")]
  Join(#[from] JoinError),
  #[error("timed out waiting for {0}")]
  HandshakeTimeout(Stage),
  #[error("cancelled while waiting for {0}")]
  Cancelled(Stage),
  #[error("focus rejected session-accept: {0}")]
  AcceptRejected(String),
  #[error("invalid session-initiate")]
  InvalidInitiate(#[source] anyhow::Error),
  #[error("session identity is already set")]
  AlreadyInitiated,
  #[error("{operation} requires a received session-initiate")]
  NotInitiated { operation: &'static str },
  #[error("{operation} is not valid in state {state:?}")]
  InvalidState {
    operation: &'static str,
    state: HandshakeState,
  },
  #[error("transport error")]
  Transport(#[source] anyhow::Error),
}
