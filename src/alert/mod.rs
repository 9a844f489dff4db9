//! Alert debouncing and delivery.
//!
//! The [`Debouncer`] decides per sample whether an alert fires. Delivery is
//! behind the [`Notifier`] trait so the sampling loop can be driven with a
//! mock in tests; [`SmtpNotifier`] is the production implementation.

pub mod debounce;
pub mod smtp;

use anyhow::Result;

pub use self::debounce::{Action, AlertState, Debouncer};
pub use self::smtp::SmtpNotifier;

/// A formatted alert ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

/// Delivers alert messages to one destination.
pub trait Notifier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one message. Returns once the destination accepted it.
    fn send(&self, message: &AlertMessage)
        -> impl std::future::Future<Output = Result<()>> + Send;
}
