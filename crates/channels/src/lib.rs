//! Outbound channels: sender and composer contracts, simulated email and
//! SMS providers, and the timeout-bounded dispatcher.

pub mod composer;
pub mod dispatch;
pub mod email;
pub mod errors;
pub mod scripted;
pub mod sender;
pub mod sms;

pub use composer::{ComposeContext, ComposedMessage, ContentComposer, PassthroughComposer};
pub use dispatch::ChannelDispatcher;
pub use email::{EmailConfig, EmailProvider};
pub use errors::{classify, FailureKind};
pub use scripted::ScriptedSender;
pub use sender::{ChannelSender, OutboundMessage, SendOutcome};
pub use sms::{SmsProvider, TwilioConfig};
