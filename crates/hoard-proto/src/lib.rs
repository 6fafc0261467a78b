//! Hoard Protocol - Wire protocol and message definitions.
//!
//! This crate defines:
//! - The `Message` envelope exchanged between file servers
//! - Frame tags and the length-delimited frame codec that multiplexes
//!   control messages and raw byte streams over one socket

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod frame;
pub mod messages;

pub use frame::{FrameError, FrameHeader, FrameTag, MAX_CONTROL_FRAME_SIZE};
pub use messages::{Message, MessageType, RequestId};
