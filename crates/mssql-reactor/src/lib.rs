//! # mssql-reactor
//!
//! Reactive cursored query exchange engine for Microsoft SQL Server's TDS
//! protocol.
//!
//! The engine drives server-side cursors through the fixed system procedures
//! (`sp_executesql`, `sp_cursoropen`, `sp_cursorprepexec`, `sp_cursorexecute`,
//! `sp_cursorfetch`, `sp_cursorclose`), producing a demand-paced stream of
//! result tokens while honoring transaction scope, prepared-statement reuse,
//! cancellation, and automatic re-preparation after server-side invalidation.
//!
//! ## Architecture
//!
//! - A [`Client`] owns the transport (a [`Transport`] channel pair to the
//!   framing layer) through a connection actor that serializes logical
//!   exchanges: one request/response conversation is active at a time, and
//!   further submissions queue in FIFO order.
//! - Each query subscription spawns an exchange whose reducer consumes the
//!   inbound tokens in arrival order, filters what the consumer sees, and
//!   emits follow-up fetch/close requests onto the same exchange.
//! - Environment-change listeners fold transaction descriptors and the
//!   database collation into the connection state before the triggering token
//!   is surfaced, so every new request carries the current scope.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_reactor::{Binding, Client, Connection, ConnectionOptions, Transport};
//!
//! let (transport, peer) = Transport::channel(64);
//! // hand `peer` to the framing layer that owns the socket
//!
//! let client = Client::new(transport);
//! let connection = Connection::new(client, ConnectionOptions::new().with_fetch_size(128));
//!
//! let mut rows = connection.query("SELECT name FROM users", Binding::empty())?;
//! while let Some(message) = rows.next_message().await {
//!     // rows, column metadata, intermediate counts, ...
//! }
//! ```

#![warn(missing_docs)]

pub mod binding;
pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod exchange;
pub mod statement_cache;

mod query_logger;

pub use binding::{Binding, BoundParameter};
pub use client::{Client, ConnectionContext, TransactionStatus, Transport, TransportPeer};
pub use config::{
    parse_duration, ConnectionOptions, SignedDuration, StatementCacheSpec, DEFAULT_FETCH_SIZE,
};
pub use connection::{
    Connection, IsolationLevel, TransactionDefinition, ValidationDepth,
};
pub use cursor::{exchange, exchange_cursored, exchange_direct, exchange_prepared};
pub use error::{classify, requires_reprepare, Error, ErrorDisposition, Result};
pub use exchange::QueryStream;
pub use statement_cache::{PreparedStatementCache, UNPREPARED};
