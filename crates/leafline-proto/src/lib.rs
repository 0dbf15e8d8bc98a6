//! # leafline-proto
//!
//! Wire envelope for the storefront's real-time channels (assistant chat and
//! delivery tracking).
//!
//! Every frame is a JSON text message with a `type` discriminator. Frames
//! announcing a session (`connection` / `session`) carry a server-issued
//! `session_id`; liveness uses a `ping` / `pong` pair; everything else is an
//! application frame whose body is passed through untouched.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod frames;

pub use error::ProtoError;
pub use frames::{
    encode_application, normalize_outbound, ApplicationFrame, ControlFrame, InboundFrame,
    SessionFrame, SessionFrameKind,
};
