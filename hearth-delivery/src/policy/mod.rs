//! Policies governing retry behaviour

pub mod retry;

pub use retry::RetryPolicy;
