//! Cursored query message flow.
//!
//! Queries are exchanged through RPC calls against the fixed system
//! procedures: `sp_executesql` for direct execution, `sp_cursoropen` for
//! plain cursored queries, and `sp_cursorprepexec`/`sp_cursorexecute` for
//! parameterized cursored queries, followed by `sp_cursorfetch` /
//! `sp_cursorclose` round-trips on the same exchange.
//!
//! Requests are created deferred: the connection can be used concurrently,
//! so each request reads the latest transaction descriptor and collation at
//! the moment it is built.

use std::sync::Arc;

use parking_lot::Mutex;

use tds_wire::{
    decode_int, Collation, Message, ProcId, ReturnValue, RpcDirection, RpcOptionFlags, RpcRequest,
    RpcValue, TransactionDescriptor,
};

use crate::binding::Binding;
use crate::client::{Client, SharedState};
use crate::config::ConnectionOptions;
use crate::error::{self, Error, Result};
use crate::exchange::{FlowOutput, MessageFlow, QueryStream};
use crate::query_logger;
use crate::statement_cache::{PreparedStatementCache, UNPREPARED};

// Constants for server-cursored result sets, from the engine cursors
// functional specification.

/// Fetch the first window.
pub const FETCH_FIRST: i32 = 1;
/// Fetch the next window. The only fetch type this engine issues.
pub const FETCH_NEXT: i32 = 2;
/// Fetch the previous window.
pub const FETCH_PREV: i32 = 4;
/// Fetch the last window.
pub const FETCH_LAST: i32 = 8;
/// Fetch from an absolute position.
pub const FETCH_ABSOLUTE: i32 = 16;
/// Fetch relative to the current position.
pub const FETCH_RELATIVE: i32 = 32;
/// Refresh the current window.
pub const FETCH_REFRESH: i32 = 128;
/// Query cursor information.
pub const FETCH_INFO: i32 = 256;
/// Fetch the previous window without position adjustment.
pub const FETCH_PREV_NOADJUST: i32 = 512;

/// Forward-only scroll option.
pub const SCROLLOPT_FORWARD_ONLY: i32 = 4;
/// Parameterized-statement scroll option, set when a binding is present.
pub const SCROLLOPT_PARAMETERIZED_STMT: i32 = 4096;

/// Read-only concurrency option.
pub const CCOPT_READ_ONLY: i32 = 1;
/// Allow the server to answer without a cursor where possible.
pub const CCOPT_ALLOW_DIRECT: i32 = 8192;

/// Info token number signalling that the statement did not produce a cursor
/// and results stream directly.
pub(crate) const INFO_DIRECT_MODE: i64 = 16954;

/// Ordinal below which `sp_executesql`, `sp_cursoropen` and
/// `sp_cursorexecute` return values are internal and suppressed.
const SURFACED_ORDINAL: u16 = 5;

/// Ordinal below which `sp_cursorprepexec` return values are internal and
/// suppressed.
const SURFACED_ORDINAL_PREPEXEC: u16 = 7;

/// Cursoring phase of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    /// No cursor interaction has completed yet.
    #[default]
    None,
    /// A fetch round-trip is in progress.
    Fetching,
    /// A prepared-statement invalidation is being retried.
    PrepareRetry,
    /// The cursor is being closed.
    Closing,
    /// The exchange is complete.
    Closed,
    /// A server error surfaced; the exchange finishes without fetching.
    Error,
}

/// Per-exchange cursoring state.
#[derive(Debug, Default)]
pub(crate) struct CursorState {
    /// Server-assigned cursor id; zero means none/invalid.
    pub(crate) cursor_id: i32,
    pub(crate) phase: Phase,
    /// Last observed MORE flag of a `DONEINPROC` token.
    pub(crate) has_more: bool,
    /// Whether any row arrived in the current fetch window. MORE typically
    /// reports true, so rows decide whether cursoring continues.
    pub(crate) has_seen_rows: bool,
    pub(crate) has_seen_error: bool,
    pub(crate) error_number: Option<i64>,
    /// Set by INFO 16954 or for direct exchanges from the start; suppresses
    /// all cursor handling for the remainder of the exchange.
    pub(crate) direct_mode: bool,
    pub(crate) cancel_requested: bool,
}

impl CursorState {
    /// Track rows and errors for the fetch/close decision.
    fn observe(&mut self, message: &Message) {
        match message {
            Message::Row(_) => self.has_seen_rows = true,
            Message::Error(e) => {
                self.error_number = Some(e.number);
                self.has_seen_error = true;
            }
            _ => {}
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        if phase == Phase::PrepareRetry {
            self.error_number = None;
            self.has_seen_error = false;
        }
    }

    fn wants_more(&self) -> bool {
        !self.cancel_requested
    }
}

enum CursorMode {
    /// `sp_executesql`; no cursor round-trips.
    Direct,
    /// `sp_cursoropen` for a plain query.
    Text,
    /// `sp_cursorprepexec` / `sp_cursorexecute` for a parameterized query.
    Prepared {
        cache: Arc<Mutex<PreparedStatementCache>>,
        handle: i32,
        needs_prepare: bool,
        retry_available: bool,
    },
}

/// The cursor flow state machine, driven over one exchange's inbound tokens.
pub(crate) struct CursorFlow {
    shared: Arc<SharedState>,
    query: String,
    binding: Binding,
    fetch_size: u32,
    mode: CursorMode,
    state: CursorState,
}

/// Execute a query directly through `sp_executesql`.
///
/// # Errors
///
/// Fails synchronously on an empty query, a closed connection, or a full
/// request queue.
pub fn exchange_direct(
    client: &Client,
    options: &ConnectionOptions,
    query: &str,
    binding: Binding,
) -> Result<QueryStream> {
    let flow = CursorFlow::direct(client, query, binding)?;
    query_logger::log_query(client.context(), query);
    client.submit(Box::new(flow), options.statement_timeout())
}

/// Execute a plain query through a server cursor.
///
/// # Errors
///
/// Fails synchronously on an empty query, a closed connection, or a full
/// request queue.
pub fn exchange_cursored(
    client: &Client,
    options: &ConnectionOptions,
    query: &str,
) -> Result<QueryStream> {
    let flow = CursorFlow::cursored(client, query, options.fetch_size())?;
    query_logger::log_query(client.context(), query);
    client.submit(Box::new(flow), options.statement_timeout())
}

/// Execute a parameterized query through a server cursor, reusing a prepared
/// statement handle when the cache holds one.
///
/// # Errors
///
/// Fails synchronously on an empty query, a closed connection, or a full
/// request queue.
pub fn exchange_prepared(
    client: &Client,
    options: &ConnectionOptions,
    cache: &Arc<Mutex<PreparedStatementCache>>,
    query: &str,
    binding: Binding,
) -> Result<QueryStream> {
    let flow = CursorFlow::prepared(client, cache, query, binding, options.fetch_size())?;
    query_logger::log_query(client.context(), query);
    client.submit(Box::new(flow), options.statement_timeout())
}

/// Execute a query, routing by fetch size and binding: a fetch size of zero
/// disables cursoring, an empty binding uses the plain cursored flow, and a
/// non-empty binding uses the prepared flow.
///
/// # Errors
///
/// Fails synchronously on an empty query, a closed connection, or a full
/// request queue.
pub fn exchange(
    client: &Client,
    options: &ConnectionOptions,
    cache: &Arc<Mutex<PreparedStatementCache>>,
    query: &str,
    binding: Binding,
) -> Result<QueryStream> {
    if !options.prefers_cursors() {
        exchange_direct(client, options, query, binding)
    } else if binding.is_empty() {
        exchange_cursored(client, options, query)
    } else {
        exchange_prepared(client, options, cache, query, binding)
    }
}

impl CursorFlow {
    fn direct(client: &Client, query: &str, binding: Binding) -> Result<Self> {
        let mut flow = Self::new(client.shared(), query, binding, 0, CursorMode::Direct)?;
        flow.state.direct_mode = true;
        Ok(flow)
    }

    fn cursored(client: &Client, query: &str, fetch_size: u32) -> Result<Self> {
        Self::new(
            client.shared(),
            query,
            Binding::empty(),
            fetch_size,
            CursorMode::Text,
        )
    }

    fn prepared(
        client: &Client,
        cache: &Arc<Mutex<PreparedStatementCache>>,
        query: &str,
        binding: Binding,
        fetch_size: u32,
    ) -> Result<Self> {
        let handle = cache.lock().get_handle(query, &binding);
        let mode = CursorMode::Prepared {
            cache: Arc::clone(cache),
            handle,
            needs_prepare: handle == UNPREPARED,
            retry_available: true,
        };
        Self::new(client.shared(), query, binding, fetch_size, mode)
    }

    fn new(
        shared: Arc<SharedState>,
        query: &str,
        binding: Binding,
        fetch_size: u32,
        mode: CursorMode,
    ) -> Result<Self> {
        if query.is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".into()));
        }
        if fetch_size > i32::MAX as u32 {
            return Err(Error::InvalidArgument(format!(
                "fetch size out of range: {fetch_size}"
            )));
        }

        Ok(Self {
            shared,
            query: query.to_string(),
            binding,
            fetch_size,
            mode,
            state: CursorState::default(),
        })
    }

    fn collation(&self) -> Option<Collation> {
        self.shared.collation()
    }

    fn descriptor(&self) -> TransactionDescriptor {
        self.shared.transaction_descriptor()
    }

    /// Decode internal return values and decide whether to surface the token.
    fn handle_return_value(&mut self, return_value: &ReturnValue) -> Result<bool> {
        match &mut self.mode {
            CursorMode::Direct => Ok(return_value.ordinal >= SURFACED_ORDINAL),
            CursorMode::Text => {
                // sp_cursoropen OUT: 0 = cursor, 4 = rowcount
                if return_value.ordinal == 0 {
                    self.state.cursor_id = decode_int(return_value)?;
                    tracing::debug!(cursor_id = self.state.cursor_id, "cursor opened");
                }
                Ok(return_value.ordinal >= SURFACED_ORDINAL)
            }
            CursorMode::Prepared {
                cache,
                needs_prepare,
                ..
            } => {
                // sp_cursorprepexec OUT: 0 = handle, 1 = cursor
                // sp_cursorexecute OUT: 1 = cursor
                if return_value.ordinal == 1 {
                    self.state.cursor_id = decode_int(return_value)?;
                    tracing::debug!(cursor_id = self.state.cursor_id, "cursor opened");
                }

                if *needs_prepare {
                    if return_value.ordinal == 0 {
                        let prepared = decode_int(return_value)?;
                        tracing::debug!(handle = prepared, "prepared statement");
                        cache.lock().put_handle(prepared, &self.query, &self.binding);
                    }
                    Ok(return_value.ordinal >= SURFACED_ORDINAL_PREPEXEC)
                } else {
                    Ok(return_value.ordinal >= SURFACED_ORDINAL)
                }
            }
        }
    }

    /// Shared token handling after return-value and retry processing.
    fn handle_message(&mut self, message: Message, out: &mut FlowOutput, emit: bool) -> Result<()> {
        if let Message::ColumnMetadata(metadata) = &message {
            if !metadata.has_columns() {
                return Ok(());
            }
        }

        if let Message::Info(info) = &message {
            if info.number == INFO_DIRECT_MODE {
                self.state.direct_mode = true;
            }
        }

        if let Message::DoneInProc(done) = &message {
            self.state.has_more = done.has_more();

            if !self.state.direct_mode {
                // Per-window row counts surface as intermediate counts so the
                // consumer can publish rows-updated per fetch.
                if self.state.phase == Phase::Fetching && done.has_count() {
                    out.emit(Message::IntermediateCount(*done));
                }
                return Ok(());
            }

            if emit {
                out.emit(message);
            }
            return Ok(());
        }

        if message.is_attention_ack() {
            self.state.set_phase(Phase::Closed);
            out.emit(message);
            out.complete();
            return Ok(());
        }

        let done_proc = match &message {
            Message::DoneProc(done) => Some(*done),
            _ => {
                if emit && is_downstream_visible(&message) {
                    out.emit(message);
                }
                return Ok(());
            }
        };

        if self.state.has_seen_error {
            tracing::debug!(number = self.state.error_number, "finishing exchange after server error");
            self.state.set_phase(Phase::Error);
        }

        if done_proc.is_some_and(|done| done.is_done()) {
            self.on_done(out);
        }

        Ok(())
    }

    /// Decide the follow-up action at the end of a procedure response:
    /// complete the exchange, fetch the next window, or close the cursor.
    fn on_done(&mut self, out: &mut FlowOutput) {
        if self.is_final_state() {
            self.state.set_phase(Phase::Closed);
            out.complete();
            return;
        }

        let phase = self.state.phase;
        if phase == Phase::None || phase == Phase::Fetching {
            if ((self.state.has_more && phase == Phase::None) || self.state.has_seen_rows)
                && self.state.wants_more()
            {
                if phase == Phase::None {
                    self.state.set_phase(Phase::Fetching);
                }
                out.request(sp_cursor_fetch(
                    self.state.cursor_id,
                    FETCH_NEXT,
                    self.fetch_size,
                    self.descriptor(),
                ));
            } else {
                self.state.set_phase(Phase::Closing);
                out.request(sp_cursor_close(self.state.cursor_id, self.descriptor()));
            }

            self.state.has_seen_rows = false;
        }
    }

    fn is_final_state(&self) -> bool {
        let phase = self.state.phase;

        if (phase == Phase::None || phase == Phase::Fetching) && self.state.cursor_id == 0 {
            return true;
        }

        matches!(phase, Phase::Error | Phase::Closing | Phase::Closed)
    }
}

impl MessageFlow for CursorFlow {
    fn initial(&mut self, out: &mut FlowOutput) -> Result<()> {
        let request = match &self.mode {
            CursorMode::Direct => {
                sp_execute_sql(&self.query, &self.binding, self.collation(), self.descriptor())
            }
            CursorMode::Text => sp_cursor_open(&self.query, self.collation(), self.descriptor()),
            CursorMode::Prepared {
                handle,
                needs_prepare,
                ..
            } => {
                if *needs_prepare {
                    sp_cursor_prep_exec(
                        UNPREPARED,
                        &self.query,
                        &self.binding,
                        self.collation(),
                        self.descriptor(),
                    )
                } else {
                    sp_cursor_execute(*handle, &self.binding, self.descriptor())?
                }
            }
        };

        out.request(request);
        Ok(())
    }

    fn on_message(&mut self, message: Message, out: &mut FlowOutput) -> Result<()> {
        self.state.observe(&message);

        if let Message::ReturnValue(return_value) = &message {
            let surface = self.handle_return_value(return_value)?;
            if !surface || self.state.phase == Phase::PrepareRetry {
                // Dropping the token releases the payload buffer.
                return Ok(());
            }
            out.emit(message);
            return Ok(());
        }

        if let Message::Error(error_token) = &message {
            if let CursorMode::Prepared {
                retry_available, ..
            } = &mut self.mode
            {
                if *retry_available && error::requires_reprepare(error_token.number) {
                    *retry_available = false;
                    tracing::debug!(
                        number = error_token.number,
                        "prepared statement no longer valid"
                    );
                    self.state.set_phase(Phase::PrepareRetry);
                }
            }
        }

        // While a retry is pending, tokens of the failed attempt stay hidden.
        let emit = self.state.phase != Phase::PrepareRetry;

        if message.is_final_done_proc() && self.state.phase == Phase::PrepareRetry {
            tracing::debug!(sql = %self.query, "re-preparing statement");

            if let CursorMode::Prepared {
                cache,
                handle,
                needs_prepare,
                ..
            } = &mut self.mode
            {
                cache.lock().invalidate(&self.query, &self.binding);
                *handle = UNPREPARED;
                *needs_prepare = true;
            }

            self.state.set_phase(Phase::None);
            out.request(sp_cursor_prep_exec(
                UNPREPARED,
                &self.query,
                &self.binding,
                self.collation(),
                self.descriptor(),
            ));
            return Ok(());
        }

        self.handle_message(message, out, emit)
    }

    fn on_cancel(&mut self) {
        self.state.cancel_requested = true;
    }
}

/// Tokens that may surface to the consumer of a cursored exchange.
fn is_downstream_visible(message: &Message) -> bool {
    match message {
        Message::Row(_)
        | Message::ColumnMetadata(_)
        | Message::ReturnValue(_)
        | Message::DoneInProc(_)
        | Message::IntermediateCount(_)
        | Message::Error(_)
        | Message::Info(_) => true,
        Message::Done(_) => message.is_attention_ack(),
        _ => false,
    }
}

/// Create an `sp_executesql` request executing a statement that returns
/// results directly.
pub(crate) fn sp_execute_sql(
    query: &str,
    binding: &Binding,
    collation: Option<Collation>,
    transaction_descriptor: TransactionDescriptor,
) -> RpcRequest {
    let mut builder = RpcRequest::builder()
        .with_proc_id(ProcId::ExecuteSql)
        .with_transaction_descriptor(transaction_descriptor)
        .with_parameter(RpcDirection::In, RpcValue::unicode(collation, query))
        .with_parameter(
            RpcDirection::In,
            RpcValue::unicode(collation, binding.formal_parameters()),
        );

    for param in binding.iter() {
        builder = builder.with_named_parameter(param.direction, &param.name, param.value.clone());
    }

    builder.build()
}

/// Create an `sp_cursoropen` request executing a statement that returns a
/// cursor.
pub(crate) fn sp_cursor_open(
    query: &str,
    collation: Option<Collation>,
    transaction_descriptor: TransactionDescriptor,
) -> RpcRequest {
    let scroll_opt = SCROLLOPT_FORWARD_ONLY;
    let cc_opt = CCOPT_READ_ONLY | CCOPT_ALLOW_DIRECT;

    RpcRequest::builder()
        .with_proc_id(ProcId::CursorOpen)
        .with_transaction_descriptor(transaction_descriptor)
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)) // cursor
        .with_parameter(RpcDirection::In, RpcValue::unicode(collation, query))
        .with_parameter(RpcDirection::In, RpcValue::Int(scroll_opt)) // scrollopt
        .with_parameter(RpcDirection::In, RpcValue::Int(cc_opt)) // ccopt
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)) // rowcount
        .build()
}

/// Create an `sp_cursorprepexec` request preparing and executing a
/// parameterized statement. `prepared_statement_handle` is the old handle to
/// unprepare before repreparing, or [`UNPREPARED`].
pub(crate) fn sp_cursor_prep_exec(
    prepared_statement_handle: i32,
    query: &str,
    binding: &Binding,
    collation: Option<Collation>,
    transaction_descriptor: TransactionDescriptor,
) -> RpcRequest {
    let scroll_opt = SCROLLOPT_FORWARD_ONLY
        | if binding.is_empty() {
            0
        } else {
            SCROLLOPT_PARAMETERIZED_STMT
        };
    let cc_opt = CCOPT_READ_ONLY | CCOPT_ALLOW_DIRECT;

    let mut builder = RpcRequest::builder()
        .with_proc_id(ProcId::CursorPrepExec)
        .with_transaction_descriptor(transaction_descriptor)
        .with_parameter(RpcDirection::Out, RpcValue::Int(prepared_statement_handle))
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)) // cursor
        .with_parameter(
            RpcDirection::In,
            RpcValue::unicode(collation, binding.formal_parameters()),
        )
        .with_parameter(RpcDirection::In, RpcValue::unicode(collation, query))
        .with_parameter(RpcDirection::In, RpcValue::Int(scroll_opt)) // scrollopt
        .with_parameter(RpcDirection::In, RpcValue::Int(cc_opt)) // ccopt
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)); // rowcount

    for param in binding.iter() {
        builder = builder.with_named_parameter(param.direction, &param.name, param.value.clone());
    }

    builder.build()
}

/// Create an `sp_cursorexecute` request executing a previously prepared
/// statement.
pub(crate) fn sp_cursor_execute(
    prepared_statement_handle: i32,
    binding: &Binding,
    transaction_descriptor: TransactionDescriptor,
) -> Result<RpcRequest> {
    if prepared_statement_handle == UNPREPARED {
        return Err(Error::InvalidArgument(
            "invalid prepared statement handle".into(),
        ));
    }

    let scroll_opt = SCROLLOPT_FORWARD_ONLY;
    let cc_opt = CCOPT_READ_ONLY | CCOPT_ALLOW_DIRECT;

    let mut builder = RpcRequest::builder()
        .with_proc_id(ProcId::CursorExecute)
        .with_transaction_descriptor(transaction_descriptor)
        .with_parameter(RpcDirection::In, RpcValue::Int(prepared_statement_handle))
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)) // cursor
        .with_parameter(RpcDirection::In, RpcValue::Int(scroll_opt)) // scrollopt
        .with_parameter(RpcDirection::In, RpcValue::Int(cc_opt)) // ccopt
        .with_parameter(RpcDirection::Out, RpcValue::Int(0)); // rowcount

    for param in binding.iter() {
        builder = builder.with_named_parameter(param.direction, &param.name, param.value.clone());
    }

    Ok(builder.build())
}

/// Create an `sp_cursorfetch` request fetching `row_count` rows. Column
/// metadata is suppressed through the `NO_METADATA` option flag.
pub(crate) fn sp_cursor_fetch(
    cursor: i32,
    fetch_type: i32,
    row_count: u32,
    transaction_descriptor: TransactionDescriptor,
) -> RpcRequest {
    RpcRequest::builder()
        .with_proc_id(ProcId::CursorFetch)
        .with_transaction_descriptor(transaction_descriptor)
        .with_option_flags(RpcOptionFlags::empty().disable_metadata())
        .with_parameter(RpcDirection::In, RpcValue::Int(cursor))
        .with_parameter(RpcDirection::In, RpcValue::Int(fetch_type))
        .with_parameter(RpcDirection::In, RpcValue::Int(0)) // startRow
        .with_parameter(RpcDirection::In, RpcValue::Int(row_count as i32)) // numRows
        .build()
}

/// Create an `sp_cursorclose` request releasing server resources.
pub(crate) fn sp_cursor_close(
    cursor: i32,
    transaction_descriptor: TransactionDescriptor,
) -> RpcRequest {
    RpcRequest::builder()
        .with_proc_id(ProcId::CursorClose)
        .with_transaction_descriptor(transaction_descriptor)
        .with_parameter(RpcDirection::In, RpcValue::Int(cursor))
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tds_wire::{
        ClientMessage, ColumnMetadata, Done, DoneInProc, DoneProc, DoneStatus, Row, ServerError,
        ServerInfo,
    };

    fn text_flow() -> CursorFlow {
        CursorFlow::new(
            Arc::new(SharedState::default()),
            "SELECT name FROM users",
            Binding::empty(),
            10,
            CursorMode::Text,
        )
        .unwrap()
    }

    fn direct_flow() -> CursorFlow {
        let mut flow = CursorFlow::new(
            Arc::new(SharedState::default()),
            "SELECT 1",
            Binding::empty(),
            0,
            CursorMode::Direct,
        )
        .unwrap();
        flow.state.direct_mode = true;
        flow
    }

    fn prepared_flow(
        cache: &Arc<Mutex<PreparedStatementCache>>,
        binding: Binding,
    ) -> CursorFlow {
        let handle = cache.lock().get_handle("SELECT @id", &binding);
        CursorFlow::new(
            Arc::new(SharedState::default()),
            "SELECT @id",
            binding,
            10,
            CursorMode::Prepared {
                cache: Arc::clone(cache),
                handle,
                needs_prepare: handle == UNPREPARED,
                retry_available: true,
            },
        )
        .unwrap()
    }

    fn row() -> Message {
        Message::Row(Row {
            data: Bytes::from_static(&[0x01]),
        })
    }

    fn column_metadata(columns: usize) -> Message {
        Message::ColumnMetadata(ColumnMetadata {
            columns: (0..columns)
                .map(|i| tds_wire::token::Column {
                    name: format!("c{i}"),
                    type_id: 0x26,
                    flags: 0,
                })
                .collect(),
        })
    }

    fn done_in_proc(more: bool, count: Option<u64>) -> Message {
        Message::DoneInProc(DoneInProc {
            status: DoneStatus {
                more,
                count: count.is_some(),
                ..DoneStatus::default()
            },
            current_command: 0,
            row_count: count.unwrap_or(0),
        })
    }

    fn done_proc(more: bool) -> Message {
        Message::DoneProc(DoneProc {
            status: DoneStatus {
                more,
                ..DoneStatus::default()
            },
            current_command: 0,
            row_count: 0,
        })
    }

    fn attention_ack() -> Message {
        Message::Done(Done {
            status: DoneStatus {
                attention: true,
                ..DoneStatus::default()
            },
            current_command: 0,
            row_count: 0,
        })
    }

    fn return_value_int(ordinal: u16, value: i32) -> Message {
        let encoded = value.to_le_bytes();
        Message::ReturnValue(ReturnValue {
            ordinal,
            name: String::new(),
            status: 1,
            type_id: 0x26,
            value: Bytes::copy_from_slice(&[4, encoded[0], encoded[1], encoded[2], encoded[3]]),
        })
    }

    fn server_error(number: i64) -> Message {
        Message::Error(ServerError {
            number,
            state: 1,
            class: 16,
            message: "error".into(),
            server: String::new(),
            procedure: String::new(),
            line: 1,
        })
    }

    fn server_info(number: i64) -> Message {
        Message::Info(ServerInfo {
            number,
            state: 1,
            class: 0,
            message: "info".into(),
            server: String::new(),
            procedure: String::new(),
            line: 1,
        })
    }

    fn feed(flow: &mut CursorFlow, messages: Vec<Message>) -> FlowOutput {
        let mut out = FlowOutput::default();
        for message in messages {
            flow.on_message(message, &mut out).unwrap();
        }
        out
    }

    fn fetch_requests(out: &FlowOutput) -> Vec<ProcId> {
        out.requested()
            .iter()
            .map(|request| match request {
                ClientMessage::Rpc(rpc) => rpc.proc_id(),
                other => panic!("unexpected request: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_open_with_rows_fetches_next_window() {
        let mut flow = text_flow();
        let out = feed(
            &mut flow,
            vec![
                column_metadata(1),
                row(),
                done_in_proc(true, Some(1)),
                return_value_int(0, 42),
                done_proc(false),
            ],
        );

        assert_eq!(flow.state.cursor_id, 42);
        assert_eq!(flow.state.phase, Phase::Fetching);
        assert_eq!(fetch_requests(&out), vec![ProcId::CursorFetch]);
        assert!(!out.is_complete());

        // The open OUT parameters stay internal; metadata and row surface.
        assert_eq!(out.emitted().len(), 2);
    }

    #[test]
    fn test_fetch_request_layout() {
        let request = sp_cursor_fetch(42, FETCH_NEXT, 10, TransactionDescriptor::empty());
        assert_eq!(request.proc_id(), ProcId::CursorFetch);
        assert!(request.option_flags().no_metadata);
        assert_eq!(request.params().len(), 4);
        assert_eq!(request.params()[0].value, RpcValue::Int(42));
        assert_eq!(request.params()[1].value, RpcValue::Int(FETCH_NEXT));
        assert_eq!(request.params()[2].value, RpcValue::Int(0));
        assert_eq!(request.params()[3].value, RpcValue::Int(10));
    }

    #[test]
    fn test_open_request_layout() {
        let request = sp_cursor_open("SELECT 1", None, TransactionDescriptor::empty());
        assert_eq!(request.proc_id(), ProcId::CursorOpen);
        let params = request.params();
        assert_eq!(params.len(), 5);
        assert_eq!(params[0].direction, RpcDirection::Out);
        assert_eq!(params[2].value, RpcValue::Int(SCROLLOPT_FORWARD_ONLY));
        assert_eq!(
            params[3].value,
            RpcValue::Int(CCOPT_READ_ONLY | CCOPT_ALLOW_DIRECT)
        );
        assert_eq!(params[4].direction, RpcDirection::Out);
    }

    #[test]
    fn test_prep_exec_request_layout() {
        let binding = Binding::empty().bind("id", RpcValue::Int(7));
        let request = sp_cursor_prep_exec(
            UNPREPARED,
            "SELECT @id",
            &binding,
            None,
            TransactionDescriptor::empty(),
        );

        let params = request.params();
        // 7 positional parameters plus the named binding.
        assert_eq!(params.len(), 8);
        assert_eq!(params[0].direction, RpcDirection::Out);
        assert_eq!(params[0].value, RpcValue::Int(UNPREPARED));
        assert_eq!(params[1].direction, RpcDirection::Out);
        assert_eq!(
            params[4].value,
            RpcValue::Int(SCROLLOPT_FORWARD_ONLY | SCROLLOPT_PARAMETERIZED_STMT)
        );
        assert_eq!(params[7].name.as_deref(), Some("@id"));
    }

    #[test]
    fn test_prep_exec_without_binding_is_not_parameterized() {
        let request = sp_cursor_prep_exec(
            UNPREPARED,
            "SELECT 1",
            &Binding::empty(),
            None,
            TransactionDescriptor::empty(),
        );
        assert_eq!(
            request.params()[4].value,
            RpcValue::Int(SCROLLOPT_FORWARD_ONLY)
        );
    }

    #[test]
    fn test_execute_sql_always_carries_formal_parameters() {
        let request = sp_execute_sql(
            "SELECT 1",
            &Binding::empty(),
            None,
            TransactionDescriptor::empty(),
        );
        assert_eq!(request.proc_id(), ProcId::ExecuteSql);
        assert_eq!(request.params().len(), 2);
        assert_eq!(
            request.params()[1].value,
            RpcValue::unicode(None, String::new())
        );
    }

    #[test]
    fn test_execute_with_unprepared_handle_is_rejected() {
        let result = sp_cursor_execute(UNPREPARED, &Binding::empty(), TransactionDescriptor::empty());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_cursor_completes_without_fetch_or_close() {
        let mut flow = text_flow();
        let out = feed(
            &mut flow,
            vec![return_value_int(0, 0), done_proc(false)],
        );

        assert!(out.is_complete());
        assert!(out.requested().is_empty());
        assert_eq!(flow.state.phase, Phase::Closed);
    }

    #[test]
    fn test_no_rows_closes_cursor() {
        let mut flow = text_flow();
        flow.state.cursor_id = 42;
        flow.state.set_phase(Phase::Fetching);

        let out = feed(
            &mut flow,
            vec![done_in_proc(false, Some(0)), done_proc(false)],
        );

        assert_eq!(flow.state.phase, Phase::Closing);
        assert_eq!(fetch_requests(&out), vec![ProcId::CursorClose]);

        // The close response ends the exchange.
        let out = feed(&mut flow, vec![done_proc(false)]);
        assert!(out.is_complete());
        assert_eq!(flow.state.phase, Phase::Closed);
    }

    #[test]
    fn test_intermediate_count_only_while_fetching() {
        let mut flow = text_flow();

        // Opening window: count suppressed, phase is still None.
        let out = feed(&mut flow, vec![done_in_proc(true, Some(10))]);
        assert!(out.emitted().is_empty());

        flow.state.cursor_id = 42;
        flow.state.set_phase(Phase::Fetching);
        let out = feed(&mut flow, vec![done_in_proc(true, Some(3))]);
        assert_eq!(out.emitted().len(), 1);
        assert!(matches!(
            out.emitted()[0],
            Message::IntermediateCount(done) if done.row_count == 3
        ));
    }

    #[test]
    fn test_zero_column_metadata_suppressed() {
        let mut flow = text_flow();
        let out = feed(&mut flow, vec![column_metadata(0)]);
        assert!(out.emitted().is_empty());
    }

    #[test]
    fn test_direct_mode_forwards_done_in_proc() {
        let mut flow = direct_flow();
        let out = feed(
            &mut flow,
            vec![
                column_metadata(1),
                row(),
                done_in_proc(false, Some(1)),
                done_proc(false),
            ],
        );

        assert!(out.is_complete());
        assert!(out.requested().is_empty());
        assert_eq!(out.emitted().len(), 3);
        assert!(matches!(out.emitted()[2], Message::DoneInProc(_)));
    }

    #[test]
    fn test_info_16954_switches_to_direct_mode() {
        let mut flow = text_flow();
        let out = feed(
            &mut flow,
            vec![server_info(INFO_DIRECT_MODE), done_in_proc(false, Some(1))],
        );

        assert!(flow.state.direct_mode);
        // Info surfaces, and the DONEINPROC is forwarded in direct mode.
        assert_eq!(out.emitted().len(), 2);
    }

    #[test]
    fn test_error_surfaces_and_ends_exchange() {
        let mut flow = text_flow();
        flow.state.cursor_id = 42;

        let out = feed(&mut flow, vec![server_error(102), done_proc(false)]);

        assert_eq!(flow.state.phase, Phase::Closed);
        assert!(out.is_complete());
        assert!(matches!(out.emitted()[0], Message::Error(_)));
        assert!(out.requested().is_empty());
    }

    #[test]
    fn test_attention_ack_closes_and_completes() {
        let mut flow = text_flow();
        flow.state.cursor_id = 42;
        flow.state.set_phase(Phase::Fetching);

        let out = feed(&mut flow, vec![attention_ack()]);

        assert_eq!(flow.state.phase, Phase::Closed);
        assert!(out.is_complete());
        assert!(out.emitted()[0].is_attention_ack());
    }

    #[test]
    fn test_cancel_routes_to_close() {
        let mut flow = text_flow();
        flow.state.cursor_id = 42;
        flow.state.set_phase(Phase::Fetching);
        flow.on_cancel();

        let out = feed(
            &mut flow,
            vec![row(), done_in_proc(true, Some(1)), done_proc(false)],
        );

        assert_eq!(flow.state.phase, Phase::Closing);
        assert_eq!(fetch_requests(&out), vec![ProcId::CursorClose]);
    }

    #[test]
    fn test_prepare_retry_hides_error_and_re_prepares() {
        let cache = Arc::new(Mutex::new(PreparedStatementCache::unbounded()));
        let binding = Binding::empty().bind("id", RpcValue::Int(1));
        cache.lock().put_handle(77, "SELECT @id", &binding);

        let mut flow = prepared_flow(&cache, binding.clone());
        let mut initial = FlowOutput::default();
        flow.initial(&mut initial).unwrap();
        match &initial.requested()[0] {
            ClientMessage::Rpc(rpc) => assert_eq!(rpc.proc_id(), ProcId::CursorExecute),
            other => panic!("unexpected request: {other:?}"),
        }

        let out = feed(&mut flow, vec![server_error(8179), done_proc(false)]);

        // The invalidation error stays hidden and a fresh prepexec goes out.
        assert!(out.emitted().is_empty());
        assert!(!out.is_complete());
        assert_eq!(fetch_requests(&out), vec![ProcId::CursorPrepExec]);
        assert_eq!(cache.lock().get_handle("SELECT @id", &binding), UNPREPARED);
        assert_eq!(flow.state.phase, Phase::None);
        assert!(!flow.state.has_seen_error);

        // The retried call prepares handle 88 and opens cursor 0 (empty).
        let out = feed(
            &mut flow,
            vec![
                return_value_int(0, 88),
                return_value_int(1, 0),
                done_proc(false),
            ],
        );
        assert!(out.is_complete());
        assert_eq!(cache.lock().get_handle("SELECT @id", &binding), 88);
    }

    #[test]
    fn test_prepare_retry_at_most_once() {
        let cache = Arc::new(Mutex::new(PreparedStatementCache::unbounded()));
        let binding = Binding::empty().bind("id", RpcValue::Int(1));
        cache.lock().put_handle(77, "SELECT @id", &binding);

        let mut flow = prepared_flow(&cache, binding);
        feed(&mut flow, vec![server_error(8179), done_proc(false)]);

        // A second invalidation error is surfaced instead of retried.
        let out = feed(&mut flow, vec![server_error(8179), done_proc(false)]);
        assert!(matches!(out.emitted()[0], Message::Error(_)));
        assert_eq!(flow.state.phase, Phase::Closed);
        assert!(out.is_complete());
    }

    #[test]
    fn test_prep_exec_return_value_thresholds() {
        let cache = Arc::new(Mutex::new(PreparedStatementCache::unbounded()));
        let binding = Binding::empty().bind("id", RpcValue::Int(1));

        let mut flow = prepared_flow(&cache, binding);
        let out = feed(
            &mut flow,
            vec![
                return_value_int(0, 88),
                return_value_int(1, 42),
                return_value_int(6, 0),
                return_value_int(7, 123),
            ],
        );

        assert_eq!(flow.state.cursor_id, 42);
        // Ordinals 0..6 are prepexec OUT parameters; 7 and above surface.
        assert_eq!(out.emitted().len(), 1);
        assert!(matches!(
            &out.emitted()[0],
            Message::ReturnValue(rv) if rv.ordinal == 7
        ));
    }

    #[test]
    fn test_execute_return_value_thresholds() {
        let cache = Arc::new(Mutex::new(PreparedStatementCache::unbounded()));
        let binding = Binding::empty().bind("id", RpcValue::Int(1));
        cache.lock().put_handle(77, "SELECT @id", &binding);

        let mut flow = prepared_flow(&cache, binding);
        let out = feed(
            &mut flow,
            vec![
                return_value_int(1, 42),
                return_value_int(4, 0),
                return_value_int(5, 9),
            ],
        );

        assert_eq!(flow.state.cursor_id, 42);
        assert_eq!(out.emitted().len(), 1);
        assert!(matches!(
            &out.emitted()[0],
            Message::ReturnValue(rv) if rv.ordinal == 5
        ));
    }

    #[test]
    fn test_rejects_empty_query() {
        let result = CursorFlow::new(
            Arc::new(SharedState::default()),
            "",
            Binding::empty(),
            10,
            CursorMode::Text,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
