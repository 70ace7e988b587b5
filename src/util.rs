pub mod error;
pub(crate) mod idempotency;
pub mod partial_success;
pub mod retry;

pub mod text;
pub mod time;
