//! Connection client: transport ownership, exchange serialization, and
//! connection-global state.
//!
//! The client is an actor task owning the transport channel pair. It accepts
//! exchange submissions over a bounded FIFO channel, activates at most one at
//! a time, routes inbound tokens to the active exchange in arrival order, and
//! drains the exchange's follow-up requests onto the wire. Environment-change
//! listeners run on the inbound path *before* a token is forwarded, so state
//! such as the transaction descriptor is always visible to the exchange that
//! observes the triggering token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use tds_wire::{
    ClientMessage, Collation, EnvChangeType, Message, TransactionDescriptor,
};

use crate::error::{Error, Result};
use crate::exchange::{spawn_exchange, ExchangeLease, ExchangeOutcome, MessageFlow, QueryStream, SimpleFlow};

/// Capacity of the exchange submission queue. Submissions beyond this bound
/// are rejected with [`Error::RequestQueueFull`].
pub(crate) const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Transaction mode of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// No explicit transaction; each statement commits on its own.
    #[default]
    AutoCommit,
    /// A transaction was started on the server.
    Started,
    /// Explicit transaction mode without an active server transaction.
    Explicit,
}

/// Identification of a connection for log correlation.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    connection_id: Uuid,
}

impl ConnectionContext {
    /// Create a context with a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection_id: Uuid::new_v4(),
        }
    }

    /// The connection id.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[cid: {}]", self.connection_id)
    }
}

#[derive(Debug, Default)]
struct SharedInner {
    transaction_descriptor: TransactionDescriptor,
    transaction_status: TransactionStatus,
    collation: Option<Collation>,
    database_version: Option<String>,
}

/// Connection-global state: written by the actor's inbound path, read from
/// user tasks.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    closed: AtomicBool,
    encryption_supported: AtomicBool,
    inner: RwLock<SharedInner>,
}

impl SharedState {
    pub(crate) fn transaction_descriptor(&self) -> TransactionDescriptor {
        self.inner.read().transaction_descriptor
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        self.inner.read().transaction_status
    }

    pub(crate) fn collation(&self) -> Option<Collation> {
        self.inner.read().collation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn update_transaction(&self, status: TransactionStatus, descriptor: TransactionDescriptor) {
        let mut inner = self.inner.write();
        inner.transaction_status = status;
        inner.transaction_descriptor = descriptor;
    }
}

/// The transport boundary: the framing layer on the other side serializes
/// [`ClientMessage`] values onto the socket and delivers decoded tokens (or a
/// terminal transport error) inbound.
pub struct Transport {
    /// Requests from the client to the framing layer.
    pub outbound: mpsc::Sender<ClientMessage>,
    /// Decoded tokens from the framing layer to the client.
    pub inbound: mpsc::Receiver<Result<Message>>,
}

/// The framing layer's side of a [`Transport`] channel pair.
pub struct TransportPeer {
    /// Requests emitted by the client.
    pub requests: mpsc::Receiver<ClientMessage>,
    /// Token delivery into the client.
    pub responses: mpsc::Sender<Result<Message>>,
}

impl Transport {
    /// Create a connected transport channel pair.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            TransportPeer {
                requests: outbound_rx,
                responses: inbound_tx,
            },
        )
    }
}

/// Handle to a connection.
///
/// Cheap to clone; all clones share the same actor and connection state.
#[derive(Clone)]
pub struct Client {
    context: ConnectionContext,
    shared: Arc<SharedState>,
    submit_tx: mpsc::Sender<ExchangeLease>,
    attention_tx: mpsc::Sender<()>,
}

impl Client {
    /// Create a client over a transport and spawn its connection actor.
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self::with_context(transport, ConnectionContext::new())
    }

    /// Create a client with an explicit connection context.
    #[must_use]
    pub fn with_context(transport: Transport, context: ConnectionContext) -> Self {
        let shared = Arc::new(SharedState::default());
        let (submit_tx, submit_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (attention_tx, attention_rx) = mpsc::channel(1);

        let actor = ConnectionActor {
            context: context.clone(),
            shared: Arc::clone(&shared),
            outbound: transport.outbound,
            inbound: transport.inbound,
            submit_rx,
            attention_rx,
        };
        tokio::spawn(actor.run());

        Self {
            context,
            shared,
            submit_tx,
            attention_tx,
        }
    }

    /// The connection context.
    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// The transaction descriptor currently in effect.
    #[must_use]
    pub fn transaction_descriptor(&self) -> TransactionDescriptor {
        self.shared.transaction_descriptor()
    }

    /// The transaction status currently in effect.
    #[must_use]
    pub fn transaction_status(&self) -> TransactionStatus {
        self.shared.transaction_status()
    }

    /// The database collation, once announced by the server.
    #[must_use]
    pub fn database_collation(&self) -> Option<Collation> {
        self.shared.collation()
    }

    /// The server version string, once announced in the login acknowledgment.
    #[must_use]
    pub fn database_version(&self) -> Option<String> {
        self.shared.inner.read().database_version.clone()
    }

    /// Whether the server acknowledged column encryption support.
    #[must_use]
    pub fn is_column_encryption_supported(&self) -> bool {
        self.shared.encryption_supported.load(Ordering::Acquire)
    }

    /// Whether the connection is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Issue an out-of-band attention request cancelling the running command.
    ///
    /// The server acknowledges with a `DONE` token carrying the attention
    /// bit, delivered in-band to the active exchange.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ConnectionClosed`] if the connection is gone.
    pub async fn attention(&self) -> Result<()> {
        self.attention_tx
            .send(())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Start a raw exchange: send `request` and stream every response token
    /// until the first message matching `is_last`.
    ///
    /// Exchanges submitted while another is active are queued and dispatched
    /// in FIFO order.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed or the submission queue is full.
    pub fn exchange(
        &self,
        request: ClientMessage,
        is_last: impl FnMut(&Message) -> bool + Send + 'static,
    ) -> Result<QueryStream> {
        self.submit(Box::new(SimpleFlow::new(request, is_last)), None)
    }

    /// Submit a flow-driven exchange, optionally arming a statement timeout
    /// that issues an attention command on expiry.
    pub(crate) fn submit(
        &self,
        flow: Box<dyn MessageFlow>,
        statement_timeout: Option<Duration>,
    ) -> Result<QueryStream> {
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (lease, stream, finished_rx) = spawn_exchange(flow);
        self.submit_tx.try_send(lease).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::RequestQueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed,
        })?;

        if let Some(timeout) = statement_timeout {
            let attention_tx = self.attention_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        tracing::debug!("statement timeout expired, requesting attention");
                        let _ = attention_tx.send(()).await;
                    }
                    _ = finished_rx => {}
                }
            });
        }

        Ok(stream)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.context.connection_id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

struct ActiveExchange {
    outbound_rx: mpsc::Receiver<ClientMessage>,
    inbound_tx: mpsc::Sender<Result<Message>>,
    done_rx: tokio::sync::oneshot::Receiver<ExchangeOutcome>,
}

struct ConnectionActor {
    context: ConnectionContext,
    shared: Arc<SharedState>,
    outbound: mpsc::Sender<ClientMessage>,
    inbound: mpsc::Receiver<Result<Message>>,
    submit_rx: mpsc::Receiver<ExchangeLease>,
    attention_rx: mpsc::Receiver<()>,
}

/// What the actor observed while an exchange is active.
enum ActiveEvent {
    AttentionRequested,
    HandlesClosed,
    Outcome(std::result::Result<ExchangeOutcome, tokio::sync::oneshot::error::RecvError>),
    /// The pending token was handed to the exchange (or the exchange is
    /// gone; completion then arrives through the outcome channel).
    Forwarded,
    Request(Option<ClientMessage>),
    Inbound(Option<Result<Message>>),
}

/// What the actor observed while no exchange is active.
enum IdleEvent {
    AttentionRequested,
    HandlesClosed,
    Lease(Option<ExchangeLease>),
    Inbound(Option<Result<Message>>),
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut active: Option<ActiveExchange> = None;
        // One inbound token awaiting hand-off to the active exchange. Kept
        // outside the channel so attention and outbound traffic stay live
        // while the exchange applies backpressure.
        let mut pending: Option<Result<Message>> = None;

        loop {
            if let Some(exchange) = active.as_mut() {
                let event = tokio::select! {
                    biased;
                    attention = self.attention_rx.recv() => match attention {
                        Some(()) => ActiveEvent::AttentionRequested,
                        None => ActiveEvent::HandlesClosed,
                    },
                    outcome = &mut exchange.done_rx => ActiveEvent::Outcome(outcome),
                    permit = exchange.inbound_tx.reserve(), if pending.is_some() => {
                        if let (Ok(permit), Some(message)) = (permit, pending.take()) {
                            permit.send(message);
                        }
                        ActiveEvent::Forwarded
                    }
                    request = exchange.outbound_rx.recv() => ActiveEvent::Request(request),
                    inbound = self.inbound.recv(), if pending.is_none() => {
                        ActiveEvent::Inbound(inbound)
                    }
                };

                match event {
                    ActiveEvent::AttentionRequested => {
                        if !self.send_attention().await {
                            break;
                        }
                    }
                    ActiveEvent::HandlesClosed => break,
                    ActiveEvent::Outcome(Ok(ExchangeOutcome::Completed)) => {
                        tracing::trace!(context = %self.context, "exchange complete");
                        active = None;
                        // A token still in hand belongs to no exchange;
                        // response tails after completion are dropped.
                        if let Some(Ok(message)) = pending.take() {
                            tracing::warn!(
                                context = %self.context,
                                "dropping unsolicited message: {message:?}"
                            );
                        }
                    }
                    ActiveEvent::Outcome(Ok(ExchangeOutcome::Fatal(e))) => {
                        self.fail(e, &mut active);
                        break;
                    }
                    ActiveEvent::Outcome(Err(_)) => {
                        self.fail(
                            Error::IllegalState("exchange task vanished".into()),
                            &mut active,
                        );
                        break;
                    }
                    ActiveEvent::Forwarded => {}
                    ActiveEvent::Request(Some(request)) => {
                        if self.outbound.send(request).await.is_err() {
                            self.fail(Error::ConnectionClosed, &mut active);
                            break;
                        }
                    }
                    ActiveEvent::Request(None) => {
                        // The exchange dropped its request ring; completion
                        // arrives through the outcome channel.
                    }
                    ActiveEvent::Inbound(inbound) => match self.preprocess(inbound) {
                        Ok(Some(message)) => pending = Some(Ok(message)),
                        Ok(None) => {
                            self.fail(Error::ConnectionClosed, &mut active);
                            break;
                        }
                        Err(e) => {
                            self.fail(e, &mut active);
                            break;
                        }
                    },
                }
            } else {
                let event = tokio::select! {
                    biased;
                    attention = self.attention_rx.recv() => match attention {
                        Some(()) => IdleEvent::AttentionRequested,
                        None => IdleEvent::HandlesClosed,
                    },
                    lease = self.submit_rx.recv() => IdleEvent::Lease(lease),
                    inbound = self.inbound.recv() => IdleEvent::Inbound(inbound),
                };

                match event {
                    IdleEvent::AttentionRequested => {
                        // No request is outstanding to cancel; sending an
                        // attention now would be misapplied to the next
                        // exchange on this connection.
                        tracing::debug!(context = %self.context, "ignoring attention without an active exchange");
                    }
                    IdleEvent::HandlesClosed => break,
                    IdleEvent::Lease(Some(lease)) => {
                        tracing::trace!(context = %self.context, "initiating exchange");
                        let ExchangeLease {
                            start_tx,
                            outbound_rx,
                            inbound_tx,
                            done_rx,
                        } = lease;
                        // Release the slot to the exchange task.
                        let _ = start_tx.send(());
                        active = Some(ActiveExchange {
                            outbound_rx,
                            inbound_tx,
                            done_rx,
                        });
                    }
                    // All client handles dropped: shut down.
                    IdleEvent::Lease(None) => break,
                    IdleEvent::Inbound(inbound) => match self.preprocess(inbound) {
                        Ok(Some(message)) => {
                            tracing::warn!(
                                context = %self.context,
                                "dropping unsolicited message: {message:?}"
                            );
                        }
                        Ok(None) => break,
                        Err(e) => {
                            self.fail(e, &mut active);
                            break;
                        }
                    },
                }
            }
        }

        self.shared.set_closed();
        self.drain_queued();
    }

    async fn send_attention(&mut self) -> bool {
        tracing::debug!(context = %self.context, "sending attention");
        self.outbound.send(ClientMessage::Attention).await.is_ok()
    }

    /// Run the environment listeners and hand the message back for routing.
    /// `Ok(None)` means the transport is closed.
    fn preprocess(&mut self, inbound: Option<Result<Message>>) -> Result<Option<Message>> {
        match inbound {
            Some(Ok(message)) => {
                self.on_message(&message)?;
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Listener updates must be visible before the token reaches a consumer.
    fn on_message(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::EnvChange(env) => match env.change_type {
                EnvChangeType::BeginTx | EnvChangeType::EnlistDtc => {
                    let descriptor = TransactionDescriptor::from_bytes(&env.new_value)?;
                    tracing::debug!(context = %self.context, "transaction started");
                    self.shared
                        .update_transaction(TransactionStatus::Started, descriptor);
                }
                EnvChangeType::CommitTx => {
                    tracing::debug!(context = %self.context, "transaction committed");
                    self.shared.update_transaction(
                        TransactionStatus::Explicit,
                        TransactionDescriptor::empty(),
                    );
                }
                EnvChangeType::RollbackTx => {
                    tracing::debug!(context = %self.context, "transaction rolled back");
                    self.shared.update_transaction(
                        TransactionStatus::Explicit,
                        TransactionDescriptor::empty(),
                    );
                }
                EnvChangeType::SqlCollation => {
                    if !env.new_value.is_empty() {
                        let collation = env.new_collation()?;
                        self.shared.inner.write().collation = Some(collation);
                    }
                }
                _ => {}
            },
            Message::LoginAck(ack) => {
                self.shared.inner.write().database_version =
                    Some(format!("{} {:#010x}", ack.prog_name, ack.prog_version));
            }
            Message::FeatureExtAck(ack) => {
                if ack.supports_column_encryption() {
                    self.shared
                        .encryption_supported
                        .store(true, Ordering::Release);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fail the active exchange with `error` and poison the connection.
    fn fail(&mut self, error: Error, active: &mut Option<ActiveExchange>) {
        tracing::warn!(context = %self.context, error = %error, "connection failed");
        self.shared.set_closed();

        if let Some(exchange) = active.take() {
            let _ = exchange.inbound_tx.try_send(Err(error));
            // Dropping the lease closes the inbound channel; the exchange
            // task terminates and completes its downstream.
        }
    }

    /// Fail every queued exchange. Dropping a lease before dispatch makes the
    /// exchange task deliver a terminal error downstream.
    fn drain_queued(&mut self) {
        self.submit_rx.close();
        while self.submit_rx.try_recv().is_ok() {}
    }
}
