//! Notification pipeline: payloads, templates, the mail transport, the
//! email-channel handler and the producer used by the request path.

pub mod handler;
pub mod mailer;
pub mod payload;
pub mod producer;
pub mod templates;

pub use handler::{MailSettings, NotificationHandler};
pub use mailer::{DeliveryId, MailError, Mailer, OutboundEmail, ResendMailer};
pub use payload::{EmailPayload, TemplateData};
pub use producer::NotificationProducer;
pub use templates::{RenderedEmail, render};
