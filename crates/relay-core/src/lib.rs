//! # relay-core
//!
//! Shared vocabulary for the relay workspace:
//!
//! - **IDs**: [`RequestId`] (client-assigned, positive) and [`ConnectionId`]
//! - **Messages**: [`Request`], [`Response`], [`BinaryResponse`] and the
//!   [`Outbound`] sum type routed by the dispatcher
//! - **Decoding**: [`decode_request`] turns a raw text frame into a typed request
//! - **Bus**: [`EventBus`], the in-process publish/subscribe channel between
//!   the transport and business logic
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod bus;
pub mod decode;
pub mod ids;
pub mod logging;
pub mod messages;

pub use bus::EventBus;
pub use decode::{DecodeError, decode_request};
pub use ids::{ConnectionId, InvalidRequestId, RequestId};
pub use messages::{
    BinaryResponse, FileEntry, Outbound, Request, RequestKind, Response, ResponseBody,
};
