//! Inbound token model.
//!
//! The framing layer decodes each TDS token into one of the variants of
//! [`Message`] and hands it to the client in arrival order. The client never
//! sees raw token bytes except for row data and return-value payloads, which
//! are carried as [`Bytes`] slices of the receive buffer and released when the
//! owning token is dropped.

use bytes::Bytes;

use crate::collation::Collation;

/// A decoded server message.
///
/// This tagged union replaces token-class dispatch: the exchange engine's
/// reducer is a single `match` over it. [`Message::IntermediateCount`] never
/// arrives from the server; it is synthesized by the cursor engine from a
/// `DONEINPROC` token observed during a fetch window.
#[derive(Debug, Clone)]
pub enum Message {
    /// Row data for the current result set.
    Row(Row),
    /// Column metadata describing the shape of the following rows.
    ColumnMetadata(ColumnMetadata),
    /// An OUT parameter or return value of an RPC call.
    ReturnValue(ReturnValue),
    /// Completion of a statement inside a stored procedure.
    DoneInProc(DoneInProc),
    /// Completion of a stored procedure.
    DoneProc(DoneProc),
    /// Completion of a SQL batch; with the ATTN bit set this acknowledges an
    /// attention request.
    Done(Done),
    /// Server error message.
    Error(ServerError),
    /// Server informational message.
    Info(ServerInfo),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Feature extension acknowledgment.
    FeatureExtAck(FeatureExtAck),
    /// Client-synthesized per-fetch-window row count.
    IntermediateCount(DoneInProc),
}

impl Message {
    /// Whether this message is a `DONE` token acknowledging an attention
    /// request.
    #[must_use]
    pub fn is_attention_ack(&self) -> bool {
        matches!(self, Self::Done(done) if done.status.attention)
    }

    /// Whether this message is a `DONEPROC` token that terminates the final
    /// procedure of the response.
    #[must_use]
    pub fn is_final_done_proc(&self) -> bool {
        matches!(self, Self::DoneProc(done) if done.is_done())
    }
}

/// Row data. Column values remain in wire form until the row is materialized
/// by the result layer.
#[derive(Debug, Clone)]
pub struct Row {
    /// Raw column data backed by the receive buffer.
    pub data: Bytes,
}

/// A column descriptor within a metadata token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Raw TDS type id.
    pub type_id: u8,
    /// Column flags.
    pub flags: u16,
}

/// Column metadata token.
///
/// The server emits a zero-column variant (`COLMETADATA` with count `0xFFFF`)
/// for statements without a result set; the engine suppresses those.
#[derive(Debug, Clone, Default)]
pub struct ColumnMetadata {
    /// Column descriptors, possibly empty.
    pub columns: Vec<Column>,
}

impl ColumnMetadata {
    /// Whether this token describes at least one column.
    #[must_use]
    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Status bits shared by the `DONE` token family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneStatus {
    /// More results follow (`DONE_MORE`).
    pub more: bool,
    /// An error terminated the statement (`DONE_ERROR`).
    pub error: bool,
    /// A transaction is in progress (`DONE_INXACT`).
    pub in_xact: bool,
    /// The row count field is valid (`DONE_COUNT`).
    pub count: bool,
    /// Acknowledges an attention request (`DONE_ATTN`).
    pub attention: bool,
    /// A server error caused the statement to terminate (`DONE_SRVERROR`).
    pub server_error: bool,
}

impl DoneStatus {
    /// Decode the status from its wire bits.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            more: bits & 0x0001 != 0,
            error: bits & 0x0002 != 0,
            in_xact: bits & 0x0004 != 0,
            count: bits & 0x0010 != 0,
            attention: bits & 0x0020 != 0,
            server_error: bits & 0x0100 != 0,
        }
    }

    /// Encode the status into its wire bits.
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        let mut bits = 0;
        if self.more {
            bits |= 0x0001;
        }
        if self.error {
            bits |= 0x0002;
        }
        if self.in_xact {
            bits |= 0x0004;
        }
        if self.count {
            bits |= 0x0010;
        }
        if self.attention {
            bits |= 0x0020;
        }
        if self.server_error {
            bits |= 0x0100;
        }
        bits
    }
}

/// `DONE` token ending a SQL batch.
#[derive(Debug, Clone, Copy)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Token of the current SQL statement.
    pub current_command: u16,
    /// Row count, valid when `status.count` is set.
    pub row_count: u64,
}

impl Done {
    /// Whether this `DONE` ends the response (no further results follow).
    #[must_use]
    pub fn is_done(&self) -> bool {
        !self.status.more
    }
}

/// `DONEINPROC` token ending a statement within a stored procedure.
#[derive(Debug, Clone, Copy)]
pub struct DoneInProc {
    /// Status flags.
    pub status: DoneStatus,
    /// Token of the current SQL statement.
    pub current_command: u16,
    /// Row count, valid when `status.count` is set.
    pub row_count: u64,
}

impl DoneInProc {
    /// Whether further results follow within the procedure.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.status.more
    }

    /// Whether the row count field is valid.
    #[must_use]
    pub fn has_count(&self) -> bool {
        self.status.count
    }
}

/// `DONEPROC` token ending a stored procedure.
#[derive(Debug, Clone, Copy)]
pub struct DoneProc {
    /// Status flags.
    pub status: DoneStatus,
    /// Token of the current SQL statement.
    pub current_command: u16,
    /// Row count, valid when `status.count` is set.
    pub row_count: u64,
}

impl DoneProc {
    /// Whether this token terminates the final procedure of the response.
    ///
    /// Nested procedure calls produce intermediate `DONEPROC` tokens with the
    /// `MORE` bit set; only the final one drives the exchange state machine.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !self.status.more
    }
}

/// `RETURNVALUE` token carrying an OUT parameter of an RPC call.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Zero-based parameter ordinal within the RPC parameter list.
    pub ordinal: u16,
    /// Parameter name, possibly empty.
    pub name: String,
    /// Status byte (1 = OUT parameter of a procedure call).
    pub status: u8,
    /// Raw TDS type id of the payload.
    pub type_id: u8,
    /// Raw value payload backed by the receive buffer.
    pub value: Bytes,
}

/// `ERROR` token.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Server error number.
    pub number: i64,
    /// Error state.
    pub state: u8,
    /// Severity class (0-25).
    pub class: u8,
    /// Error message text.
    pub message: String,
    /// Name of the server that produced the error.
    pub server: String,
    /// Procedure name, if raised inside one.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i64,
}

/// `INFO` token.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Informational message number.
    pub number: i64,
    /// Message state.
    pub state: u8,
    /// Severity class (informational messages are class 0-10).
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Name of the server that produced the message.
    pub server: String,
    /// Procedure name, if raised inside one.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: i64,
}

/// Environment change type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// SQL collation changed.
    SqlCollation = 7,
    /// Transaction started.
    BeginTx = 8,
    /// Transaction committed.
    CommitTx = 9,
    /// Transaction rolled back.
    RollbackTx = 10,
    /// Enlisted in a DTC transaction.
    EnlistDtc = 11,
    /// Defected from a DTC transaction.
    DefectTx = 12,
    /// Routing information.
    Routing = 20,
}

/// `ENVCHANGE` token.
///
/// Old and new values are kept in wire form; their interpretation depends on
/// the change type (string for database/language, binary for transaction
/// descriptors and collations).
#[derive(Debug, Clone)]
pub struct EnvChange {
    /// The kind of environment change.
    pub change_type: EnvChangeType,
    /// New value in wire form.
    pub new_value: Bytes,
    /// Old value in wire form.
    pub old_value: Bytes,
}

impl EnvChange {
    /// Decode the new value as a collation, for `SqlCollation` changes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the payload is shorter than a collation.
    pub fn new_collation(&self) -> Result<Collation, crate::error::ProtocolError> {
        Collation::decode(&self.new_value)
    }
}

/// `LOGINACK` token.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Negotiated TDS version.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

/// A single acknowledged feature within `FEATUREEXTACK`.
#[derive(Debug, Clone)]
pub struct FeatureAck {
    /// Feature id.
    pub feature_id: u8,
    /// Feature acknowledgment data.
    pub data: Bytes,
}

/// `FEATUREEXTACK` token.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtAck {
    /// Acknowledged features.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    /// Feature id for column encryption.
    pub const COLUMN_ENCRYPTION: u8 = 0x04;

    /// Whether the server acknowledged column encryption support.
    #[must_use]
    pub fn supports_column_encryption(&self) -> bool {
        self.features
            .iter()
            .any(|feature| feature.feature_id == Self::COLUMN_ENCRYPTION)
    }
}
