//! Transport adapter: outbound execute/cancel messages and routing of inbound
//! results into the request cache.
//!
//! The channel itself is abstracted behind [`Transport`]. Correlation is by
//! query string only; responses may arrive in any order relative to
//! requests for other keys.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cache::RequestCache;
use crate::error::{ClientError, TransportError};
use crate::key::QueryString;
use crate::raw::RawResult;
use crate::tracer::Tracer;

/// Message sent upstream to the query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Execute a query.
    Execute {
        /// The query to run.
        #[serde(rename = "queryString")]
        query_string: QueryString,
    },
    /// Best-effort hint that nobody needs the result any more. Not
    /// acknowledged; the result may still arrive.
    Cancel {
        /// The query to drop.
        #[serde(rename = "queryString")]
        query_string: QueryString,
    },
}

impl ClientMessage {
    /// The query string the message refers to.
    pub fn query_string(&self) -> &QueryString {
        match self {
            ClientMessage::Execute { query_string } | ClientMessage::Cancel { query_string } => {
                query_string
            }
        }
    }
}

/// Message received from the query service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Outcome of executing a query string.
    Result {
        /// The query string this result is for.
        #[serde(rename = "queryString")]
        query_string: QueryString,
        /// Rows, or the backend's error.
        rows: RawResult,
        /// Execution time reported by the service, in milliseconds.
        #[serde(
            rename = "queryTime",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        query_time: Option<f64>,
    },
}

/// A bidirectional message channel's outbound half.
///
/// Implementations only enqueue; they must not block waiting for the remote
/// side.
pub trait Transport: Send + Sync + 'static {
    /// Hand a message to the channel.
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        (**self).send(message)
    }
}

/// Transport backed by an unbounded tokio channel. The receiving half is
/// drained by whatever owns the real socket.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver of its outbound messages.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::msg("outbound channel closed"))
    }
}

/// Wraps the transport for the client: emits outbound messages and routes
/// every inbound result to [`RequestCache::deliver`].
///
/// This is cheap to clone.
#[derive(Clone)]
pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    cache: Arc<RequestCache>,
    tracer: Arc<dyn Tracer>,
}

impl TransportAdapter {
    /// Create an adapter delivering into `cache`.
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<RequestCache>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            transport,
            cache,
            tracer,
        }
    }

    /// Emit an execute message for `query_string`.
    ///
    /// The tracer only sees messages the transport accepted.
    pub fn send(&self, query_string: &QueryString) -> Result<(), TransportError> {
        debug!(query = %query_string, "sending query");
        self.transport.send(ClientMessage::Execute {
            query_string: query_string.clone(),
        })?;
        self.tracer.on_send(query_string);
        Ok(())
    }

    /// Emit a best-effort cancel hint for `query_string`.
    pub fn send_cancel(&self, query_string: &QueryString) -> Result<(), TransportError> {
        debug!(query = %query_string, "sending cancel hint");
        self.transport.send(ClientMessage::Cancel {
            query_string: query_string.clone(),
        })
    }

    /// Route an inbound message. Returns the number of waiters notified.
    pub fn handle_message(&self, message: ServerMessage) -> usize {
        match message {
            ServerMessage::Result {
                query_string,
                rows,
                query_time,
            } => {
                trace!(query = %query_string, ?query_time, "received result");
                let notified = self.cache.deliver(&query_string, Arc::new(rows));
                self.tracer.on_deliver(&query_string, notified);
                notified
            }
        }
    }

    /// Decode a JSON frame and route it.
    pub fn handle_frame(&self, frame: &str) -> Result<usize, ClientError> {
        let message: ServerMessage = serde_json::from_str(frame)
            .map_err(|err| ClientError::MalformedMessage(Arc::new(err)))?;
        Ok(self.handle_message(message))
    }

    /// Route every message from `inbound` until the sender side closes.
    ///
    /// This is the single inbound handler for the connection.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle_message(message);
        }
        debug!("inbound channel closed");
    }

    /// Send every query still in flight again, e.g. after a reconnect.
    ///
    /// Returns the number of queries re-sent. Stops at the first failure;
    /// calling it again re-sends every key still in flight, including those
    /// that already went out. Duplicate executes are harmless since results
    /// are matched by query string, and a second result for a key just
    /// replaces the first.
    pub fn resend_in_flight(&self) -> Result<usize, TransportError> {
        let keys = self.cache.in_flight();
        for key in &keys {
            self.send(key).inspect_err(|err| {
                warn!(query = %key, %err, "failed to resend in-flight query");
            })?;
        }
        Ok(keys.len())
    }
}

impl std::fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter() -> (
        TransportAdapter,
        Arc<RequestCache>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (transport, rx) = ChannelTransport::new();
        let cache = Arc::new(RequestCache::default());
        let adapter = TransportAdapter::new(Arc::new(transport), cache.clone(), Arc::new(NoopTracer));
        (adapter, cache, rx)
    }

    #[test]
    fn test_client_message_wire_format() {
        let message = ClientMessage::Execute {
            query_string: "SELECT 1".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "execute", "queryString": "SELECT 1"})
        );
        let cancel: ClientMessage =
            serde_json::from_value(json!({"type": "cancel", "queryString": "SELECT 1"})).unwrap();
        assert_eq!(cancel.query_string().as_str(), "SELECT 1");
    }

    #[test]
    fn test_server_message_decodes_rows_and_errors() {
        let ok: ServerMessage = serde_json::from_value(json!({
            "type": "result",
            "queryString": "Q",
            "rows": [{"count_star()": 10}],
            "queryTime": 3.5,
        }))
        .unwrap();
        let ServerMessage::Result { rows, query_time, .. } = ok;
        assert_eq!(rows.rows().unwrap().len(), 1);
        assert_eq!(query_time, Some(3.5));

        let err: ServerMessage = serde_json::from_value(json!({
            "type": "result",
            "queryString": "Q",
            "rows": {"message": "Catalog Error"},
        }))
        .unwrap();
        let ServerMessage::Result { rows, query_time, .. } = err;
        assert!(rows.is_error());
        assert_eq!(query_time, None);
    }

    #[test]
    fn test_send_and_cancel_reach_channel() {
        let (adapter, _cache, mut rx) = adapter();
        let key = QueryString::from("Q");
        adapter.send(&key).unwrap();
        adapter.send_cancel(&key).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Execute {
                query_string: key.clone()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Cancel { query_string: key }
        );
    }

    #[test]
    fn test_closed_channel_is_transport_error() {
        let (adapter, _cache, rx) = adapter();
        drop(rx);
        assert!(adapter.send(&QueryString::from("Q")).is_err());
    }

    #[test]
    fn test_handle_frame_delivers() {
        let (adapter, cache, _rx) = adapter();
        let notified = adapter
            .handle_frame(r#"{"type":"result","queryString":"ECHO:b","rows":[{"v":7}]}"#)
            .unwrap();
        assert_eq!(notified, 0);
        let entry = cache.snapshot(&QueryString::from("ECHO:b")).unwrap();
        assert!(entry.last_result.is_some());

        assert!(matches!(
            adapter.handle_frame("not json"),
            Err(ClientError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_resend_in_flight() {
        let (adapter, cache, mut rx) = adapter();
        cache.acquire(&QueryString::from("A"), Box::new(|_| {}));
        cache.acquire(&QueryString::from("B"), Box::new(|_| {}));
        cache.deliver(&QueryString::from("B"), Arc::new(RawResult::Rows(vec![])));

        assert_eq!(adapter.resend_in_flight().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().query_string().as_str(), "A");
        assert!(rx.try_recv().is_err());
    }

    #[derive(Default)]
    struct CountingSends(AtomicUsize);

    impl Tracer for CountingSends {
        fn on_send(&self, _query: &QueryString) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_tracer_counts_only_accepted_sends() {
        let (transport, rx) = ChannelTransport::new();
        let cache = Arc::new(RequestCache::default());
        let sends = Arc::new(CountingSends::default());
        let adapter = TransportAdapter::new(Arc::new(transport), cache, sends.clone());

        adapter.send(&QueryString::from("A")).unwrap();
        drop(rx);
        assert!(adapter.send(&QueryString::from("B")).is_err());
        assert_eq!(sends.0.load(Ordering::Relaxed), 1);
    }

    /// Accepts a fixed number of messages, then reports a closed socket.
    struct Budgeted {
        remaining: AtomicUsize,
        sent: parking_lot::Mutex<Vec<String>>,
    }

    impl Transport for Budgeted {
        fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
            let left = self.remaining.load(Ordering::Relaxed);
            if left == 0 {
                return Err(TransportError::msg("socket closed"));
            }
            self.remaining.store(left - 1, Ordering::Relaxed);
            self.sent.lock().push(message.query_string().to_string());
            Ok(())
        }
    }

    #[test]
    fn test_resend_after_partial_failure_repeats_keys() {
        let transport = Arc::new(Budgeted {
            remaining: AtomicUsize::new(1),
            sent: Default::default(),
        });
        let cache = Arc::new(RequestCache::default());
        let adapter = TransportAdapter::new(transport.clone(), cache.clone(), Arc::new(NoopTracer));
        cache.acquire(&QueryString::from("A"), Box::new(|_| {}));
        cache.acquire(&QueryString::from("B"), Box::new(|_| {}));

        assert!(adapter.resend_in_flight().is_err());
        assert_eq!(*transport.sent.lock(), vec!["A"]);

        transport.remaining.store(2, Ordering::Relaxed);
        assert_eq!(adapter.resend_in_flight().unwrap(), 2);
        assert_eq!(*transport.sent.lock(), vec!["A", "A", "B"]);
    }

    #[tokio::test]
    async fn test_run_routes_until_closed() {
        let (adapter, cache, _rx) = adapter();
        let (tx, inbound) = mpsc::unbounded_channel();
        tx.send(ServerMessage::Result {
            query_string: "A".into(),
            rows: RawResult::Rows(vec![]),
            query_time: None,
        })
        .unwrap();
        drop(tx);

        adapter.run(inbound).await;
        assert!(cache.snapshot(&QueryString::from("A")).is_some());
    }
}
