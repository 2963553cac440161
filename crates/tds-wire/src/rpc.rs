//! RPC request model.
//!
//! An RPC request invokes a stored procedure with typed positional and named
//! parameters. The cursor engine only ever calls the fixed system procedures
//! identified by [`ProcId`], whose parameter layouts are bit-exact contracts
//! with the server. Requests are built through [`RpcRequest::builder`] and are
//! immutable afterwards; byte encoding is performed by the framing layer.

use crate::collation::Collation;
use crate::transaction::TransactionDescriptor;

/// Well-known stored procedure ids recognized by SQL Server without a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// `sp_cursor` (0x0001)
    Cursor = 0x0001,
    /// `sp_cursoropen` (0x0002)
    CursorOpen = 0x0002,
    /// `sp_cursorprepare` (0x0003)
    CursorPrepare = 0x0003,
    /// `sp_cursorexecute` (0x0004)
    CursorExecute = 0x0004,
    /// `sp_cursorprepexec` (0x0005)
    CursorPrepExec = 0x0005,
    /// `sp_cursorunprepare` (0x0006)
    CursorUnprepare = 0x0006,
    /// `sp_cursorfetch` (0x0007)
    CursorFetch = 0x0007,
    /// `sp_cursoroption` (0x0008)
    CursorOption = 0x0008,
    /// `sp_cursorclose` (0x0009)
    CursorClose = 0x0009,
    /// `sp_executesql` (0x000A)
    ExecuteSql = 0x000A,
    /// `sp_prepare` (0x000B)
    Prepare = 0x000B,
    /// `sp_execute` (0x000C)
    Execute = 0x000C,
    /// `sp_prepexec` (0x000D)
    PrepExec = 0x000D,
    /// `sp_unprepare` (0x000F)
    Unprepare = 0x000F,
}

/// Direction of an RPC parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDirection {
    /// Input parameter.
    In,
    /// Output parameter; the server answers with a `RETURNVALUE` token.
    Out,
}

/// RPC option flags (2 bytes on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcOptionFlags {
    /// Recompile the procedure before execution.
    pub with_recompile: bool,
    /// Suppress column metadata in the response.
    pub no_metadata: bool,
    /// Reuse metadata from the previous call.
    pub reuse_metadata: bool,
}

impl RpcOptionFlags {
    /// Empty flag set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Enable the `NO_METADATA` flag.
    #[must_use]
    pub fn disable_metadata(mut self) -> Self {
        self.no_metadata = true;
        self
    }

    /// Encode to the wire representation.
    #[must_use]
    pub fn encode(&self) -> u16 {
        let mut flags = 0;
        if self.with_recompile {
            flags |= 0x0001;
        }
        if self.no_metadata {
            flags |= 0x0002;
        }
        if self.reuse_metadata {
            flags |= 0x0004;
        }
        flags
    }
}

/// A typed RPC parameter value.
///
/// The variants cover the types the cursor engine sends; the framing layer
/// maps each to its TDS type info and value encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    /// 32-bit integer (`INTN`, length 4).
    Int(i32),
    /// 64-bit integer (`INTN`, length 8).
    BigInt(i64),
    /// Boolean (`BITN`).
    Bit(bool),
    /// 64-bit float (`FLTN`, length 8).
    Float(f64),
    /// Unicode string (`NVARCHAR`) with the collation in effect when the
    /// request was built.
    NVarChar {
        /// Database collation to encode the string under.
        collation: Option<Collation>,
        /// String value.
        value: String,
    },
    /// Binary data (`BIGVARBINARY`).
    VarBinary(bytes::Bytes),
    /// Typed NULL; carries the formal type declaration.
    Null(&'static str),
}

impl RpcValue {
    /// Unicode string value under a collation.
    #[must_use]
    pub fn unicode(collation: Option<Collation>, value: impl Into<String>) -> Self {
        Self::NVarChar {
            collation,
            value: value.into(),
        }
    }

    /// The SQL type declaration for this value, as used in formal parameter
    /// definitions passed to `sp_executesql` and the cursor procedures.
    #[must_use]
    pub fn type_declaration(&self) -> String {
        match self {
            Self::Int(_) => "int".to_string(),
            Self::BigInt(_) => "bigint".to_string(),
            Self::Bit(_) => "bit".to_string(),
            Self::Float(_) => "float".to_string(),
            Self::NVarChar { value, .. } => {
                let len = value.encode_utf16().count();
                if len > 4000 {
                    "nvarchar(max)".to_string()
                } else {
                    format!("nvarchar({})", len.max(1))
                }
            }
            Self::VarBinary(data) => {
                if data.len() > 8000 {
                    "varbinary(max)".to_string()
                } else {
                    format!("varbinary({})", data.len().max(1))
                }
            }
            Self::Null(declaration) => (*declaration).to_string(),
        }
    }
}

/// A single positional or named RPC parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParameter {
    /// Parameter direction.
    pub direction: RpcDirection,
    /// Parameter name including the `@` prefix, or `None` for positional
    /// parameters.
    pub name: Option<String>,
    /// Parameter value.
    pub value: RpcValue,
}

/// An immutable RPC request.
///
/// Parameter order is significant: the system procedures define strict
/// positional layouts, and named parameters follow the positional list in
/// caller-supplied order.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    proc_id: ProcId,
    transaction_descriptor: TransactionDescriptor,
    option_flags: RpcOptionFlags,
    params: Vec<RpcParameter>,
}

impl RpcRequest {
    /// Start building a request for a well-known procedure.
    #[must_use]
    pub fn builder() -> RpcRequestBuilder {
        RpcRequestBuilder::default()
    }

    /// The invoked procedure.
    #[must_use]
    pub fn proc_id(&self) -> ProcId {
        self.proc_id
    }

    /// The transaction descriptor carried in the request header.
    #[must_use]
    pub fn transaction_descriptor(&self) -> TransactionDescriptor {
        self.transaction_descriptor
    }

    /// The option flags.
    #[must_use]
    pub fn option_flags(&self) -> RpcOptionFlags {
        self.option_flags
    }

    /// The ordered parameter list.
    #[must_use]
    pub fn params(&self) -> &[RpcParameter] {
        &self.params
    }
}

/// Builder for [`RpcRequest`].
#[derive(Debug, Default)]
pub struct RpcRequestBuilder {
    proc_id: Option<ProcId>,
    transaction_descriptor: TransactionDescriptor,
    option_flags: RpcOptionFlags,
    params: Vec<RpcParameter>,
}

impl RpcRequestBuilder {
    /// Set the procedure to invoke.
    #[must_use]
    pub fn with_proc_id(mut self, proc_id: ProcId) -> Self {
        self.proc_id = Some(proc_id);
        self
    }

    /// Set the transaction descriptor.
    #[must_use]
    pub fn with_transaction_descriptor(mut self, descriptor: TransactionDescriptor) -> Self {
        self.transaction_descriptor = descriptor;
        self
    }

    /// Set the option flags.
    #[must_use]
    pub fn with_option_flags(mut self, flags: RpcOptionFlags) -> Self {
        self.option_flags = flags;
        self
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn with_parameter(mut self, direction: RpcDirection, value: RpcValue) -> Self {
        self.params.push(RpcParameter {
            direction,
            name: None,
            value,
        });
        self
    }

    /// Append a named parameter. The `@` prefix is added if missing.
    #[must_use]
    pub fn with_named_parameter(
        mut self,
        direction: RpcDirection,
        name: impl Into<String>,
        value: RpcValue,
    ) -> Self {
        let name = name.into();
        let name = if name.starts_with('@') {
            name
        } else {
            format!("@{name}")
        };
        self.params.push(RpcParameter {
            direction,
            name: Some(name),
            value,
        });
        self
    }

    /// Finish the request.
    ///
    /// # Panics
    ///
    /// Panics if no procedure id was set; the engine's request constructors
    /// always set one.
    #[must_use]
    pub fn build(self) -> RpcRequest {
        RpcRequest {
            proc_id: self.proc_id.expect("RPC request requires a procedure id"),
            transaction_descriptor: self.transaction_descriptor,
            option_flags: self.option_flags,
            params: self.params,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_id_values() {
        assert_eq!(ProcId::CursorOpen as u16, 0x0002);
        assert_eq!(ProcId::CursorPrepExec as u16, 0x0005);
        assert_eq!(ProcId::CursorFetch as u16, 0x0007);
        assert_eq!(ProcId::CursorClose as u16, 0x0009);
        assert_eq!(ProcId::ExecuteSql as u16, 0x000A);
    }

    #[test]
    fn test_option_flags_encode() {
        assert_eq!(RpcOptionFlags::empty().encode(), 0);
        assert_eq!(RpcOptionFlags::empty().disable_metadata().encode(), 0x0002);
    }

    #[test]
    fn test_builder_positional_order() {
        let request = RpcRequest::builder()
            .with_proc_id(ProcId::CursorFetch)
            .with_parameter(RpcDirection::In, RpcValue::Int(42))
            .with_parameter(RpcDirection::In, RpcValue::Int(2))
            .build();

        assert_eq!(request.proc_id(), ProcId::CursorFetch);
        assert_eq!(request.params().len(), 2);
        assert_eq!(request.params()[0].value, RpcValue::Int(42));
        assert!(request.params()[0].name.is_none());
    }

    #[test]
    fn test_builder_named_parameter_prefix() {
        let request = RpcRequest::builder()
            .with_proc_id(ProcId::ExecuteSql)
            .with_named_parameter(RpcDirection::In, "p1", RpcValue::Int(1))
            .with_named_parameter(RpcDirection::Out, "@p2", RpcValue::Int(0))
            .build();

        assert_eq!(request.params()[0].name.as_deref(), Some("@p1"));
        assert_eq!(request.params()[1].name.as_deref(), Some("@p2"));
        assert_eq!(request.params()[1].direction, RpcDirection::Out);
    }

    #[test]
    fn test_type_declarations() {
        assert_eq!(RpcValue::Int(1).type_declaration(), "int");
        assert_eq!(RpcValue::BigInt(1).type_declaration(), "bigint");
        assert_eq!(
            RpcValue::unicode(None, "hello").type_declaration(),
            "nvarchar(5)"
        );
        assert_eq!(RpcValue::unicode(None, "").type_declaration(), "nvarchar(1)");
        assert_eq!(RpcValue::Null("int").type_declaration(), "int");

        let long = "x".repeat(4001);
        assert_eq!(
            RpcValue::unicode(None, long).type_declaration(),
            "nvarchar(max)"
        );
    }

    #[test]
    fn test_descriptor_default_is_empty() {
        let request = RpcRequest::builder()
            .with_proc_id(ProcId::CursorClose)
            .build();
        assert!(request.transaction_descriptor().is_empty());
    }
}
