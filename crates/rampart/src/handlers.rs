//! Bus handlers and the completion sink.
//!
//! The request handler runs the plugin chain and hands the result to the
//! response bus under the same partition key, or passes a handed-off
//! exchange to [`Handoffs`]. The response handler takes the completion sink
//! the front door left in the exchange and invokes it once.

use std::fmt;
use std::sync::Arc;

use rampart_bus::{EventBus, EventHandler, SubmitError};
use rampart_chain::{async_trait, keys, ChainRun, Exchange, GatewayResponse, PluginChain};
use rampart_telemetry::{events, ExchangeOutcome};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::handoff::Handoffs;
use crate::plugins::access_log;

/// Why a response could not be written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The client went away. Not a failure.
    #[error("client disconnected")]
    Disconnected,

    #[error("write failed: {0}")]
    Write(String),
}

/// Receives the final response of an exchange.
pub trait CompletionSink: Send + Sync {
    fn complete(self: Box<Self>, response: GatewayResponse) -> Result<(), TransportError>;
}

impl CompletionSink for oneshot::Sender<GatewayResponse> {
    fn complete(self: Box<Self>, response: GatewayResponse) -> Result<(), TransportError> {
        self.send(response).map_err(|_| TransportError::Disconnected)
    }
}

struct FnSink<F>(F);

impl<F> CompletionSink for FnSink<F>
where
    F: FnOnce(GatewayResponse) -> Result<(), TransportError> + Send + Sync,
{
    fn complete(self: Box<Self>, response: GatewayResponse) -> Result<(), TransportError> {
        (self.0)(response)
    }
}

/// Owned completion sink, stored in the exchange under
/// [`keys::COMPLETION`].
pub struct Completion(Box<dyn CompletionSink>);

impl Completion {
    pub fn new(sink: impl CompletionSink + 'static) -> Self {
        Self(Box::new(sink))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(GatewayResponse) -> Result<(), TransportError> + Send + Sync + 'static,
    {
        Self::new(FnSink(f))
    }

    /// A completion backed by a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<GatewayResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(tx), rx)
    }

    /// Attach to an exchange, replacing any previous sink.
    pub fn attach(self, exchange: &mut Exchange) {
        exchange.attributes_mut().insert(keys::COMPLETION, self);
    }

    /// Remove the sink from an exchange.
    pub fn detach(exchange: &mut Exchange) -> Option<Self> {
        exchange.attributes_mut().take::<Completion>(keys::COMPLETION)
    }

    pub fn complete(self, response: GatewayResponse) -> Result<(), TransportError> {
        self.0.complete(response)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Work item of the request bus.
#[derive(Debug)]
pub struct RequestEvent {
    pub key: u64,
    pub exchange: Exchange,
}

/// Work item of the response bus.
#[derive(Debug)]
pub struct ResponseEvent {
    pub key: u64,
    pub exchange: Exchange,
    pub response: GatewayResponse,
    pub outcome: ExchangeOutcome,
}

/// Submit a finished exchange to the response bus. A rejected submission
/// is logged; the exchange is dropped with its completion sink.
pub(crate) fn deliver(
    responses: &EventBus<ResponseEvent>,
    key: u64,
    exchange: Exchange,
    response: GatewayResponse,
    outcome: ExchangeOutcome,
) {
    let event = ResponseEvent {
        key,
        exchange,
        response,
        outcome,
    };
    if let Err(error) = responses.submit(key.to_be_bytes(), event) {
        let reason = match &error {
            SubmitError::Overloaded(_) => "response bus overloaded",
            SubmitError::ShuttingDown(_) => "response bus shutting down",
        };
        let event = error.into_inner();
        tracing::warn!(
            event = events::RESPONSE_ABANDONED,
            trace_id = %event.exchange.trace_id(),
            status = event.response.status,
            reason = reason,
            "completion abandoned"
        );
    }
}

pub struct RequestHandler {
    chain: Arc<PluginChain>,
    responses: Arc<EventBus<ResponseEvent>>,
    handoffs: Arc<Handoffs>,
}

impl RequestHandler {
    pub fn new(
        chain: Arc<PluginChain>,
        responses: Arc<EventBus<ResponseEvent>>,
        handoffs: Arc<Handoffs>,
    ) -> Self {
        Self {
            chain,
            responses,
            handoffs,
        }
    }
}

#[async_trait]
impl EventHandler<RequestEvent> for RequestHandler {
    async fn on_event(&self, event: RequestEvent) {
        let RequestEvent { key, mut exchange } = event;
        match self.chain.execute(&mut exchange).await {
            ChainRun::Finished(outcome) => {
                let kind = outcome.outcome();
                deliver(&self.responses, key, exchange, outcome.into_response(), kind);
            }
            ChainRun::Suspended(suspended) => self.handoffs.spawn(key, exchange, suspended),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseHandler;

#[async_trait]
impl EventHandler<ResponseEvent> for ResponseHandler {
    async fn on_event(&self, event: ResponseEvent) {
        let ResponseEvent {
            mut exchange,
            response,
            outcome,
            ..
        } = event;

        access_log::emit(&mut exchange, &response, outcome);

        let Some(completion) = Completion::detach(&mut exchange) else {
            tracing::debug!(trace_id = %exchange.trace_id(), "exchange has no completion sink");
            return;
        };
        let status = response.status;
        match completion.complete(response) {
            Ok(()) => tracing::trace!(
                event = events::RESPONSE_WRITTEN,
                trace_id = %exchange.trace_id(),
                status = status,
            ),
            Err(TransportError::Disconnected) => tracing::debug!(
                event = events::CLIENT_DISCONNECTED,
                trace_id = %exchange.trace_id(),
                "client went away before the response was written"
            ),
            Err(error) => tracing::warn!(
                trace_id = %exchange.trace_id(),
                error = %error,
                "failed to write response"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_chain::InboundRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response_event(exchange: Exchange) -> ResponseEvent {
        ResponseEvent {
            key: 1,
            exchange,
            response: GatewayResponse::text(200, "ok"),
            outcome: ExchangeOutcome::Terminated,
        }
    }

    #[tokio::test]
    async fn test_response_handler_completes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut exchange = Exchange::new(InboundRequest::new("GET", "/"));
        let counter = Arc::clone(&calls);
        Completion::from_fn(move |response| {
            assert_eq!(response.body.as_ref(), b"ok");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .attach(&mut exchange);

        ResponseHandler.on_event(response_event(exchange)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_completion() {
        let (completion, rx) = Completion::channel();
        let mut exchange = Exchange::new(InboundRequest::new("GET", "/"));
        completion.attach(&mut exchange);

        ResponseHandler.on_event(response_event(exchange)).await;
        let response = rx.await.expect("response");
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_dropped_receiver_is_a_disconnect() {
        let (completion, rx) = Completion::channel();
        drop(rx);
        assert_eq!(
            completion.complete(GatewayResponse::new(200)),
            Err(TransportError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_missing_sink_is_tolerated() {
        let exchange = Exchange::new(InboundRequest::new("GET", "/"));
        ResponseHandler.on_event(response_event(exchange)).await;
    }

    #[test]
    fn test_detach_takes_the_sink() {
        let mut exchange = Exchange::new(InboundRequest::new("GET", "/"));
        assert!(Completion::detach(&mut exchange).is_none());
        Completion::from_fn(|_| Ok(())).attach(&mut exchange);
        assert!(Completion::detach(&mut exchange).is_some());
        assert!(Completion::detach(&mut exchange).is_none());
    }
}
