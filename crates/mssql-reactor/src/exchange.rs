//! Exchange infrastructure.
//!
//! A logical exchange is one request/response conversation on the connection:
//! the client sends an initial request, consumes the inbound token stream,
//! possibly emits follow-up requests (cursor fetches), and completes when its
//! flow observes the last response frame. The connection actor (see
//! [`crate::client`]) serializes exchanges; this module provides the
//! per-exchange task that drives a [`MessageFlow`] over the inbound tokens and
//! the [`QueryStream`] the consumer drains.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{mpsc, oneshot};

use tds_wire::{ClientMessage, Message};

use crate::error::{Error, Result};

/// Capacity of the per-exchange outbound request ring. Overflow is a fatal
/// protocol error: the engine never has more than a single follow-up request
/// in flight.
pub(crate) const OUTBOUND_RING_CAPACITY: usize = 8;

/// Capacity of the inbound hand-off channel between the connection actor and
/// the exchange task.
pub(crate) const INBOUND_BUFFER: usize = 16;

/// Capacity of the downstream channel drained by the consumer. Filling it
/// pauses token delivery all the way down to the transport (demand pacing).
pub(crate) const DOWNSTREAM_BUFFER: usize = 32;

/// Collects the effects of applying a flow to one inbound message.
#[derive(Debug, Default)]
pub(crate) struct FlowOutput {
    emit: Vec<Message>,
    requests: Vec<ClientMessage>,
    complete: bool,
}

impl FlowOutput {
    /// Emit a message downstream.
    pub(crate) fn emit(&mut self, message: Message) {
        self.emit.push(message);
    }

    /// Enqueue a follow-up request on the exchange's outbound ring.
    pub(crate) fn request(&mut self, request: impl Into<ClientMessage>) {
        self.requests.push(request.into());
    }

    /// Mark the current message as the last response frame.
    pub(crate) fn complete(&mut self) {
        self.complete = true;
    }

    #[cfg(test)]
    pub(crate) fn emitted(&self) -> &[Message] {
        &self.emit
    }

    #[cfg(test)]
    pub(crate) fn requested(&self) -> &[ClientMessage] {
        &self.requests
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }
}

/// A state machine driven over the inbound tokens of one exchange.
///
/// The flow decides which tokens surface downstream, which follow-up requests
/// to emit, and when the exchange is complete. It is applied synchronously
/// with message delivery, so the last-frame decision always observes the
/// state updates of the message that triggered it.
pub(crate) trait MessageFlow: Send + 'static {
    /// Build the initial request(s). Called once, after the exchange has
    /// acquired the connection, so the request observes the latest
    /// connection state (transaction descriptor, collation).
    fn initial(&mut self, out: &mut FlowOutput) -> Result<()>;

    /// Apply the reducer to one inbound message.
    fn on_message(&mut self, message: Message, out: &mut FlowOutput) -> Result<()>;

    /// The downstream consumer went away. The flow should stop producing
    /// demand (the next procedure completion routes to cleanup) while the
    /// exchange keeps draining to completion.
    fn on_cancel(&mut self);
}

/// A simple text-query flow: forwards every token and completes on the first
/// message matching the supplied last-frame predicate.
///
/// Transaction commands and other SQL batches reduce to this flow.
pub(crate) struct SimpleFlow {
    request: Option<ClientMessage>,
    is_last: Box<dyn FnMut(&Message) -> bool + Send + 'static>,
    cancelled: bool,
}

impl SimpleFlow {
    pub(crate) fn new(
        request: ClientMessage,
        is_last: impl FnMut(&Message) -> bool + Send + 'static,
    ) -> Self {
        Self {
            request: Some(request),
            is_last: Box::new(is_last),
            cancelled: false,
        }
    }
}

impl MessageFlow for SimpleFlow {
    fn initial(&mut self, out: &mut FlowOutput) -> Result<()> {
        if let Some(request) = self.request.take() {
            out.request(request);
        }
        Ok(())
    }

    fn on_message(&mut self, message: Message, out: &mut FlowOutput) -> Result<()> {
        let last = (self.is_last)(&message);
        if !self.cancelled {
            out.emit(message);
        }
        if last {
            out.complete();
        }
        Ok(())
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
    }
}

/// How an exchange ended, reported to the connection actor.
#[derive(Debug)]
pub(crate) enum ExchangeOutcome {
    /// The flow observed its last response frame; the slot can be released.
    Completed,
    /// The exchange failed in a way that poisons the connection.
    Fatal(Error),
}

/// Channel endpoints the connection actor holds for one exchange.
pub(crate) struct ExchangeLease {
    /// Fired by the actor when the exchange acquires the connection.
    pub(crate) start_tx: oneshot::Sender<()>,
    /// Requests emitted by the exchange, drained onto the wire by the actor.
    pub(crate) outbound_rx: mpsc::Receiver<ClientMessage>,
    /// Inbound tokens routed to the exchange, in arrival order.
    pub(crate) inbound_tx: mpsc::Sender<Result<Message>>,
    /// Resolves when the exchange releases the connection.
    pub(crate) done_rx: oneshot::Receiver<ExchangeOutcome>,
}

/// Spawn the task driving `flow` and return the actor-side lease, the
/// consumer-side stream, and a receiver resolving when the exchange finishes
/// (used to disarm statement timeouts).
pub(crate) fn spawn_exchange(
    flow: Box<dyn MessageFlow>,
) -> (ExchangeLease, QueryStream, oneshot::Receiver<()>) {
    let (start_tx, start_rx) = oneshot::channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_RING_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (downstream_tx, downstream_rx) = mpsc::channel(DOWNSTREAM_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let (finished_tx, finished_rx) = oneshot::channel();

    tokio::spawn(run_exchange(
        flow,
        start_rx,
        inbound_rx,
        outbound_tx,
        downstream_tx,
        done_tx,
        finished_tx,
    ));

    let lease = ExchangeLease {
        start_tx,
        outbound_rx,
        inbound_tx,
        done_rx,
    };

    (lease, QueryStream::new(downstream_rx), finished_rx)
}

async fn run_exchange(
    mut flow: Box<dyn MessageFlow>,
    start_rx: oneshot::Receiver<()>,
    mut inbound_rx: mpsc::Receiver<Result<Message>>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    downstream_tx: mpsc::Sender<Result<Message>>,
    done_tx: oneshot::Sender<ExchangeOutcome>,
    _finished_tx: oneshot::Sender<()>,
) {
    // The lease was dropped before dispatch: the connection failed or closed
    // while this exchange was queued.
    if start_rx.await.is_err() {
        let _ = downstream_tx.send(Err(Error::ConnectionClosed)).await;
        return;
    }

    let mut out = FlowOutput::default();
    if let Err(e) = flow.initial(&mut out) {
        let _ = downstream_tx.send(Err(e)).await;
        let _ = done_tx.send(ExchangeOutcome::Completed);
        return;
    }

    let mut cancelled = false;
    let outcome = loop {
        if let Err(outcome) = dispatch_requests(&mut out, &outbound_tx) {
            let _ = downstream_tx.send(Err(Error::OutboundOverflow)).await;
            break outcome;
        }

        let complete = out.complete;
        for message in out.emit.drain(..) {
            if cancelled {
                // Discarded tokens drop here, releasing their buffers.
                continue;
            }
            if downstream_tx.send(Ok(message)).await.is_err() {
                cancelled = true;
                flow.on_cancel();
            }
        }

        if complete {
            break ExchangeOutcome::Completed;
        }

        match inbound_rx.recv().await {
            Some(Ok(message)) => {
                if !cancelled && downstream_tx.is_closed() {
                    cancelled = true;
                    flow.on_cancel();
                }
                if let Err(e) = flow.on_message(message, &mut out) {
                    let _ = downstream_tx.send(Err(e.clone())).await;
                    break ExchangeOutcome::Fatal(e);
                }
            }
            Some(Err(e)) => {
                let _ = downstream_tx.send(Err(e)).await;
                break ExchangeOutcome::Completed;
            }
            None => {
                let _ = downstream_tx.send(Err(Error::ConnectionClosed)).await;
                break ExchangeOutcome::Completed;
            }
        }
    };

    // Close the downstream before releasing the slot so the consumer observes
    // exactly one completion, then let the actor dispatch the next exchange.
    drop(downstream_tx);
    let _ = done_tx.send(outcome);
}

fn dispatch_requests(
    out: &mut FlowOutput,
    outbound_tx: &mpsc::Sender<ClientMessage>,
) -> std::result::Result<(), ExchangeOutcome> {
    for request in out.requests.drain(..) {
        if outbound_tx.try_send(request).is_err() {
            return Err(ExchangeOutcome::Fatal(Error::OutboundOverflow));
        }
    }
    Ok(())
}

/// The ordered stream of filtered response tokens for one exchange.
///
/// Dropping the stream cancels the subscription cooperatively: the engine
/// releases buffered tokens, closes any open cursor on the next procedure
/// completion, and drives the exchange to completion in the background.
pub struct QueryStream {
    receiver: mpsc::Receiver<Result<Message>>,
}

impl QueryStream {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<Message>>) -> Self {
        Self { receiver }
    }

    /// Receive the next token, or `None` once the exchange completed.
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        self.receiver.recv().await
    }
}

impl Stream for QueryStream {
    type Item = Result<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream").finish_non_exhaustive()
    }
}
