//! Digest delivery.
//!
//! The [`Dispatcher`] fans a rendered digest out to every subscriber of a
//! query through a [`Mailer`], recording a per-recipient outcome. Mailers:
//! - [`ResendMailer`]: Resend HTTP API
//! - [`LogMailer`]: logs the digest instead of sending it (no API key configured)

pub mod dispatcher;
pub mod mailer;
pub mod resend;

pub use dispatcher::Dispatcher;
pub use mailer::{LogMailer, Mailer};
pub use resend::ResendMailer;
