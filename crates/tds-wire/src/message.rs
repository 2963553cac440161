//! Outbound client messages.

use crate::rpc::RpcRequest;
use crate::transaction::TransactionDescriptor;

/// A message sent from the client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// An RPC invocation (packet type 0x03).
    Rpc(RpcRequest),
    /// A plain SQL batch (packet type 0x01).
    SqlBatch(SqlBatch),
    /// An out-of-band attention request cancelling the running command
    /// (packet type 0x06).
    Attention,
}

/// A SQL batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlBatch {
    /// The SQL text to execute.
    pub sql: String,
    /// Transaction descriptor carried in the request header.
    pub transaction_descriptor: TransactionDescriptor,
}

impl SqlBatch {
    /// Create a SQL batch bound to a transaction scope.
    #[must_use]
    pub fn new(sql: impl Into<String>, transaction_descriptor: TransactionDescriptor) -> Self {
        Self {
            sql: sql.into(),
            transaction_descriptor,
        }
    }
}

impl From<RpcRequest> for ClientMessage {
    fn from(request: RpcRequest) -> Self {
        Self::Rpc(request)
    }
}

impl From<SqlBatch> for ClientMessage {
    fn from(batch: SqlBatch) -> Self {
        Self::SqlBatch(batch)
    }
}
