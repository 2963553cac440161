//! # tds-wire
//!
//! Message and request models for the TDS (Tabular Data Stream) protocol as
//! consumed by the `mssql-reactor` client.
//!
//! This crate deliberately stops at the *model* boundary: inbound server
//! tokens are represented as an already-decoded tagged union ([`Message`]),
//! and outbound requests as value types ([`ClientMessage`], [`RpcRequest`])
//! that a framing layer serializes onto the wire. Packet framing, the prelogin
//! handshake and per-token byte codecs live on the other side of that
//! boundary.
//!
//! ## Contents
//!
//! - [`token`]: the inbound token union and the individual token types
//! - [`message`]: outbound client messages (RPC, SQL batch, attention)
//! - [`rpc`]: RPC request builder with directional positional/named parameters
//! - [`codec`]: decoding of scalar `RETURNVALUE` payloads (cursor ids,
//!   prepared-statement handles)
//! - [`transaction`]: the opaque 8-byte transaction descriptor
//! - [`collation`]: the database collation attached to character data

#![warn(missing_docs)]

pub mod codec;
pub mod collation;
pub mod error;
pub mod message;
pub mod rpc;
pub mod token;
pub mod transaction;

pub use codec::decode_int;
pub use collation::Collation;
pub use error::ProtocolError;
pub use message::{ClientMessage, SqlBatch};
pub use rpc::{ProcId, RpcDirection, RpcOptionFlags, RpcParameter, RpcRequest, RpcValue};
pub use token::{
    Column, ColumnMetadata, Done, DoneInProc, DoneProc, DoneStatus, EnvChange, EnvChangeType,
    FeatureAck, FeatureExtAck, LoginAck, Message, ReturnValue, Row, ServerError, ServerInfo,
};
pub use transaction::TransactionDescriptor;
