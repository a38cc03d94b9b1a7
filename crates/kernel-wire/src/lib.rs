//! Shared message types for the kernel engine and its host process.
//!
//! This crate provides the wire vocabulary spoken over the kernel channel
//! between the execution engine and the notebook host.
//!
//! # Features
//!
//! - Positional inbound action tuples (`["run", code, contextId]`)
//! - Outbound engine messages (results, errors, requests, displays, logs)
//! - MIME bundles with base64 helpers for binary image payloads
//! - TypeScript bindings for the frontend via `ts-rs`

mod base64;
mod message;

pub use base64::{decode_base64, deserialize_bytes, encode_base64, serialize_bytes};
pub use message::{
    Action, ContextId, DisplayBody, EngineMessage, ErrorInfo, InboundMessage, Inspection,
    MimeBundle, ProtocolError, RequestBody, Stream,
};

/// MIME type of the plain-text fallback every rendered bundle carries.
pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const IMAGE_SVG: &str = "image/svg+xml";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const APPLICATION_JSON: &str = "application/json";
