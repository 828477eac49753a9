//! Channel Sender implementations.
//!
//! Email goes through a SendGrid adapter whose webhook events map back onto
//! inbound enrollment events. LinkedIn touches, calls and manual tasks land in
//! an operator task queue. The router picks a sender per step kind.

pub mod email;
pub mod router;
pub mod tasks;

pub use email::{SendGridEvent, SendGridSender};
pub use router::ChannelRouter;
pub use tasks::{OutreachTask, TaskQueueSender};
