//! Core types for RaleighSL
//!
//! This crate defines the foundational types used throughout the engine:
//! - Oid / TxnId / SeqId: identifier newtypes
//! - ByteRef: shared-ownership immutable byte slices
//! - Errno: error taxonomy with stable wire names
//! - EngineConfig: recognized configuration options

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytes;
pub mod config;
pub mod error;
pub mod types;

pub use bytes::{ByteRef, ByteSource};
pub use config::EngineConfig;
pub use error::{Errno, RslResult};
pub use types::{Oid, SeqId, TxnId};
