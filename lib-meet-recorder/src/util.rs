use rand::{distributions::Alphanumeric, thread_rng, Rng};
use uuid::Uuid;

pub(crate) fn generate_id() -> String {
  Uuid::new_v4().to_string()
}

pub(crate) fn random_token(len: usize) -> String {
  thread_rng()
    .sample_iter(&Alphanumeric)
    .take(len)
    .map(char::from)
    .collect()
}
