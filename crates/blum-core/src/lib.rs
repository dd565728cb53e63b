//! # blum-core
//!
//! Foundation types shared by every blum crate:
//!
//! - Prefixed session and connection ids
//! - [`Message`] and the JSON wire frames
//! - [`SessionControl`], the seam plugins use to reach sessions

#![deny(unsafe_code)]

pub mod ids;
pub mod message;
pub mod session;

pub use ids::{ConnectionId, SessionId};
pub use message::{
    ERROR_TOPIC, ErrorCode, FrameError, InboundFrame, Message, OutboundFrame, Outgoing,
    SESSION_OPENED_TOPIC,
};
pub use session::{SessionControl, SessionError};
