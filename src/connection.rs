//! Connection layer — correlated request/notification client on top of a
//! framed duplex transport.
//!
//! Outbound requests get a correlation id and an awaiter; the reader task
//! resolves the awaiter when the matching response arrives, however far out
//! of order. Inbound server traffic is dispatched by method name to
//! registered handlers. Cancellation is advisory to the peer: a
//! `$/cancelRequest` notice goes out best-effort, the local awaiter is
//! rejected immediately either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{MessageReader, MessageWriter};
use crate::protocol::{self, Inbound, NotificationFrame, RequestFrame, ResponseError};

/// Outbound queue depth; writes beyond this apply backpressure to senders.
const OUTBOUND_QUEUE: usize = 64;

/// Failure modes for an outbound request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The local cancellation signal fired before a response arrived.
    #[error("request cancelled before a response arrived")]
    Cancelled,
    /// The peer answered with an error object.
    #[error("server rejected request: {0}")]
    Peer(ResponseError),
    /// The transport closed before (or while) the request was in flight.
    #[error("connection closed")]
    Closed,
    #[error("encoding request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RequestError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

type ResponseWaiter = oneshot::Sender<Result<Value, ResponseError>>;
type PendingMap = Arc<Mutex<HashMap<u64, ResponseWaiter>>>;

type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;
type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, ResponseError>> + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    notifications: Mutex<HashMap<String, NotificationHandler>>,
    requests: Mutex<HashMap<String, RequestHandler>>,
}

enum Outbound {
    Frame(Value),
    Quit,
}

/// Protocol client for one language-server transport.
pub struct Connection {
    outbound_tx: mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    pending: PendingMap,
    handlers: Arc<HandlerTable>,
    closed: Arc<watch::Sender<bool>>,
    io_tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Connection {
    /// Stand up the reader and writer tasks over a duplex transport.
    ///
    /// `reader` carries peer→client bytes, `writer` client→peer. For a
    /// native server these are the child's stdout and stdin.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (closed_tx, _closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);
        let pending: PendingMap = Arc::default();
        let handlers = Arc::new(HandlerTable::default());

        let writer_task = tokio::spawn(async move {
            let mut output = MessageWriter::new(writer);
            while let Some(command) = outbound_rx.recv().await {
                match command {
                    Outbound::Frame(frame) => {
                        if let Err(err) = output.send(&frame).await {
                            tracing::warn!("transport write failed: {err:#}");
                            break;
                        }
                    }
                    Outbound::Quit => break,
                }
            }
        });

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&handlers),
            outbound_tx.clone(),
            Arc::clone(&closed),
        ));

        Self {
            outbound_tx,
            next_id: AtomicU64::new(1),
            pending,
            handlers,
            closed,
            io_tasks: Mutex::new(Some((reader_task, writer_task))),
        }
    }

    async fn read_loop<R>(
        reader: R,
        pending: PendingMap,
        handlers: Arc<HandlerTable>,
        outbound_tx: mpsc::Sender<Outbound>,
        closed: Arc<watch::Sender<bool>>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut input = MessageReader::new(reader);
        loop {
            match input.recv().await {
                Ok(Some(frame)) => {
                    Self::dispatch(&frame, &pending, &handlers, &outbound_tx).await;
                }
                Ok(None) => {
                    tracing::debug!("transport closed by peer");
                    break;
                }
                Err(err) => {
                    tracing::warn!("transport read failed: {err:#}");
                    break;
                }
            }
        }
        mark_closed(&closed);
        // Fail every in-flight awaiter instead of leaving it parked forever:
        // dropping the senders resolves the receivers with a closed error.
        pending.lock().unwrap().clear();
    }

    async fn dispatch(
        frame: &Value,
        pending: &PendingMap,
        handlers: &HandlerTable,
        outbound_tx: &mpsc::Sender<Outbound>,
    ) {
        let Some(inbound) = protocol::classify(frame) else {
            tracing::trace!("dropping frame that is neither response, request nor notification");
            return;
        };

        match inbound {
            Inbound::Response { id, outcome } => {
                let waiter = pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => tracing::trace!(id, "response without a matching request"),
                }
            }
            Inbound::Request { id, method, params } => {
                let handler = handlers.requests.lock().unwrap().get(&method).cloned();
                match handler {
                    Some(handler) => {
                        let outbound_tx = outbound_tx.clone();
                        let work = handler(params);
                        tokio::spawn(async move {
                            let outcome = work.await;
                            if let Err(err) = &outcome {
                                tracing::debug!(%method, %err, "request handler answered with error");
                            }
                            let _ = outbound_tx
                                .send(Outbound::Frame(protocol::response_frame(&id, outcome)))
                                .await;
                        });
                    }
                    None => {
                        // Servers block on client/registerCapability and
                        // friends; an unhandled request must still be
                        // answered.
                        tracing::debug!(%method, "no handler for server request, answering method-not-found");
                        let frame = protocol::response_frame(
                            &id,
                            Err(ResponseError::method_not_found(&method)),
                        );
                        let _ = outbound_tx.send(Outbound::Frame(frame)).await;
                    }
                }
            }
            Inbound::Notification { method, params } => {
                let handler = handlers.notifications.lock().unwrap().get(&method).cloned();
                match handler {
                    Some(handler) => handler(params),
                    None => tracing::trace!(%method, "ignoring unhandled notification"),
                }
            }
        }
    }

    // ── outbound surface ───────────────────────────────────────────────

    /// Send a correlated request and await its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RequestError> {
        self.request_with(method, params, None).await
    }

    /// Like [`send_request`](Self::send_request), rejecting with
    /// [`RequestError::Cancelled`] if `cancel` fires first. A best-effort
    /// `$/cancelRequest` notice is sent to the peer, which may ignore it.
    pub async fn send_request_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RequestError> {
        self.request_with(method, params, Some(cancel)).await
    }

    async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        if !self.is_open() {
            return Err(RequestError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(RequestFrame::new(id, method, params))?;

        let (waiter, mut response) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, waiter);

        let started = Instant::now();
        tracing::trace!(method, id, "sending request");
        if self.outbound_tx.send(Outbound::Frame(frame)).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(RequestError::Closed);
        }

        let received = if let Some(cancel) = cancel {
            tokio::select! {
                received = &mut response => received,
                () = cancel.cancelled() => {
                    self.pending.lock().unwrap().remove(&id);
                    if let Ok(notice) = serde_json::to_value(NotificationFrame::new(
                        "$/cancelRequest",
                        Some(protocol::cancel_params(id)),
                    )) {
                        let _ = self.outbound_tx.try_send(Outbound::Frame(notice));
                    }
                    tracing::debug!(
                        method,
                        id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request cancelled"
                    );
                    return Err(RequestError::Cancelled);
                }
            }
        } else {
            response.await
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match received {
            Ok(Ok(result)) => {
                tracing::debug!(method, id, elapsed_ms, "request completed");
                Ok(result)
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    method,
                    id,
                    elapsed_ms,
                    code = error.code,
                    error = %error.message,
                    "request rejected by server"
                );
                Err(RequestError::Peer(error))
            }
            Err(_) => {
                tracing::debug!(method, id, elapsed_ms, "connection closed mid-request");
                Err(RequestError::Closed)
            }
        }
    }

    /// Fire-and-forget notification; no correlation, no response.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        if !self.is_open() {
            return Err(RequestError::Closed);
        }
        let frame = serde_json::to_value(NotificationFrame::new(method, params))?;
        tracing::trace!(method, "sending notification");
        self.outbound_tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| RequestError::Closed)
    }

    // ── inbound handler registry ───────────────────────────────────────

    /// Register the handler for an inbound notification method.
    ///
    /// At most one handler per method; a second registration is ignored.
    pub fn register_notification_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) {
        let mut table = self.handlers.notifications.lock().unwrap();
        if table.contains_key(method) {
            tracing::warn!(method, "notification handler already registered, keeping the first");
            return;
        }
        table.insert(method.to_string(), Arc::new(handler));
    }

    /// Register the handler for an inbound request method. The handler's
    /// return value (or error) becomes the response sent to the peer.
    ///
    /// At most one handler per method; a second registration is ignored.
    pub fn register_request_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) -> BoxFuture<'static, Result<Value, ResponseError>>
        + Send
        + Sync
        + 'static,
    ) {
        let mut table = self.handlers.requests.lock().unwrap();
        if table.contains_key(method) {
            tracing::warn!(method, "request handler already registered, keeping the first");
            return;
        }
        table.insert(method.to_string(), Arc::new(handler));
    }

    // ── lifecycle handshake ────────────────────────────────────────────

    /// The initialize request. Must be the first request on the connection;
    /// its result carries the capabilities the server instance caches.
    pub async fn initialize(&self, params: Value) -> Result<Value, RequestError> {
        self.send_request("initialize", Some(params)).await
    }

    /// The initialized notification, sent after a successful initialize.
    pub async fn initialized(&self) -> Result<(), RequestError> {
        self.send_notification("initialized", Some(Value::Object(serde_json::Map::new())))
            .await
    }

    /// Graceful-termination request; the acknowledgment is awaited.
    pub async fn shutdown(&self) -> Result<(), RequestError> {
        self.send_request("shutdown", None).await.map(|_| ())
    }

    /// Final exit notification, sent after shutdown was acknowledged (or as
    /// a last resort without it).
    pub async fn exit(&self) -> Result<(), RequestError> {
        self.send_notification("exit", None).await
    }

    // ── document sync ──────────────────────────────────────────────────

    pub async fn did_open(
        &self,
        uri: &str,
        language_id: &str,
        version: i32,
        text: &str,
    ) -> Result<(), RequestError> {
        self.send_notification(
            "textDocument/didOpen",
            Some(protocol::did_open_params(uri, language_id, version, text)),
        )
        .await
    }

    pub async fn did_change(
        &self,
        uri: &str,
        version: i32,
        text: &str,
    ) -> Result<(), RequestError> {
        self.send_notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(uri, version, text)),
        )
        .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), RequestError> {
        self.send_notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri)),
        )
        .await
    }

    pub async fn will_save(&self, uri: &str, reason: u8) -> Result<(), RequestError> {
        self.send_notification(
            "textDocument/willSave",
            Some(protocol::will_save_params(uri, reason)),
        )
        .await
    }

    pub async fn did_save(&self, uri: &str, text: Option<&str>) -> Result<(), RequestError> {
        self.send_notification(
            "textDocument/didSave",
            Some(protocol::did_save_params(uri, text)),
        )
        .await
    }

    /// Forward a filtered batch of watched-file changes.
    pub async fn did_change_watched_files(&self, params: Value) -> Result<(), RequestError> {
        self.send_notification("workspace/didChangeWatchedFiles", Some(params))
            .await
    }

    // ── navigation and editing ─────────────────────────────────────────
    //
    // Thin wrappers over send_request with fixed method names. Parameter
    // shapes are the host's business.

    pub async fn completion(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/completion", Some(params), cancel)
            .await
    }

    pub async fn hover(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/hover", Some(params), cancel)
            .await
    }

    pub async fn signature_help(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/signatureHelp", Some(params), cancel)
            .await
    }

    pub async fn definition(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/definition", Some(params), cancel)
            .await
    }

    pub async fn references(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/references", Some(params), cancel)
            .await
    }

    pub async fn document_symbol(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/documentSymbol", Some(params), cancel)
            .await
    }

    pub async fn workspace_symbol(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("workspace/symbol", Some(params), cancel)
            .await
    }

    pub async fn code_action(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/codeAction", Some(params), cancel)
            .await
    }

    pub async fn formatting(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/formatting", Some(params), cancel)
            .await
    }

    pub async fn range_formatting(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/rangeFormatting", Some(params), cancel)
            .await
    }

    pub async fn rename(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request_with("textDocument/rename", Some(params), cancel)
            .await
    }

    // ── connectivity ───────────────────────────────────────────────────

    /// Whether the underlying transport is still open. Transitions to
    /// closed exactly once, irreversibly.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Subscribe to the close signal. The value flips to `true` once, when
    /// the transport terminates.
    #[must_use]
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Release the transport tasks. Call at most once, after [`exit`](Self::exit).
    pub fn dispose(&self) {
        if let Some((reader_task, writer_task)) = self.io_tasks.lock().unwrap().take() {
            reader_task.abort();
            if self.outbound_tx.try_send(Outbound::Quit).is_err() {
                writer_task.abort();
            }
            mark_closed(&self.closed);
            self.pending.lock().unwrap().clear();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .field("pending", &self.pending.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

/// Flip the close signal to `true`, notifying listeners at most once.
fn mark_closed(closed: &watch::Sender<bool>) {
    closed.send_if_modified(|value| {
        if *value {
            false
        } else {
            *value = true;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        reader: MessageReader<ReadHalf<DuplexStream>>,
        writer: MessageWriter<WriteHalf<DuplexStream>>,
    }

    impl Peer {
        async fn recv(&mut self) -> Value {
            self.reader.recv().await.unwrap().unwrap()
        }

        async fn respond(&mut self, id: &Value, result: Value) {
            self.writer
                .send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                .await
                .unwrap();
        }
    }

    fn pipe() -> (Connection, Peer) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        let connection = Connection::new(near_read, near_write);
        let peer = Peer {
            reader: MessageReader::new(far_read),
            writer: MessageWriter::new(far_write),
        };
        (connection, peer)
    }

    #[tokio::test]
    async fn test_request_resolves_with_matching_response() {
        let (connection, mut peer) = pipe();

        let request = tokio::spawn(async move {
            let result = connection.send_request("x/echo", Some(json!({"n": 1}))).await;
            (connection, result)
        });

        let frame = peer.recv().await;
        assert_eq!(frame["method"], "x/echo");
        assert_eq!(frame["params"]["n"], 1);
        peer.respond(&frame["id"], json!({"echoed": true})).await;

        let (_connection, result) = request.await.unwrap();
        assert_eq!(result.unwrap()["echoed"], true);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_awaiters() {
        let (connection, mut peer) = pipe();
        let connection = Arc::new(connection);

        let first = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_request("x/a", None).await })
        };
        let frame_a = peer.recv().await;
        let second = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_request("x/b", None).await })
        };
        let frame_b = peer.recv().await;

        // Answer the second request first.
        peer.respond(&frame_b["id"], json!("b")).await;
        peer.respond(&frame_a["id"], json!("a")).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("a"));
        assert_eq!(second.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_response_for_unknown_id_is_ignored() {
        let (connection, mut peer) = pipe();

        let request =
            tokio::spawn(async move { connection.send_request("x/real", None).await });
        let frame = peer.recv().await;

        peer.writer
            .send(&json!({ "jsonrpc": "2.0", "id": 999_999, "result": "stray" }))
            .await
            .unwrap();
        peer.respond(&frame["id"], json!("real")).await;

        assert_eq!(request.await.unwrap().unwrap(), json!("real"));
    }

    #[tokio::test]
    async fn test_peer_error_rejects_the_request() {
        let (connection, mut peer) = pipe();

        let request = tokio::spawn(async move { connection.send_request("x/bad", None).await });
        let frame = peer.recv().await;
        peer.writer
            .send(&json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": { "code": -32602, "message": "invalid params" }
            }))
            .await
            .unwrap();

        match request.await.unwrap() {
            Err(RequestError::Peer(error)) => {
                assert_eq!(error.code, -32602);
                assert_eq!(error.message, "invalid params");
            }
            other => panic!("expected a peer rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_rejects_locally_and_notifies_peer() {
        let (connection, mut peer) = pipe();
        let connection = Arc::new(connection);
        let cancel = CancellationToken::new();

        let request = {
            let connection = Arc::clone(&connection);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                connection
                    .send_request_cancellable("x/slow", None, &cancel)
                    .await
            })
        };
        let slow = peer.recv().await;
        assert_eq!(slow["method"], "x/slow");

        // A second request must survive the first one's cancellation.
        let other = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_request("x/other", None).await })
        };
        let other_frame = peer.recv().await;

        cancel.cancel();
        let outcome = request.await.unwrap();
        assert!(matches!(outcome, Err(RequestError::Cancelled)));

        let notice = peer.recv().await;
        assert_eq!(notice["method"], "$/cancelRequest");
        assert_eq!(notice["params"]["id"], slow["id"]);
        assert!(notice.get("id").is_none());

        peer.respond(&other_frame["id"], json!("fine")).await;
        assert_eq!(other.await.unwrap().unwrap(), json!("fine"));
    }

    #[tokio::test]
    async fn test_notification_carries_no_id() {
        let (connection, mut peer) = pipe();
        connection
            .send_notification("x/ping", Some(json!({"seq": 9})))
            .await
            .unwrap();

        let frame = peer.recv().await;
        assert_eq!(frame["method"], "x/ping");
        assert_eq!(frame["params"]["seq"], 9);
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn test_inbound_notification_dispatches_to_handler() {
        let (connection, mut peer) = pipe();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        connection.register_notification_handler("y/event", move |params| {
            let _ = seen_tx.send(params);
        });

        peer.writer
            .send(&json!({ "jsonrpc": "2.0", "method": "y/event", "params": {"k": 5} }))
            .await
            .unwrap();

        let params = seen_rx.recv().await.unwrap().unwrap();
        assert_eq!(params["k"], 5);
    }

    #[tokio::test]
    async fn test_duplicate_handler_registration_keeps_first() {
        let (connection, mut peer) = pipe();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        {
            let seen_tx = seen_tx.clone();
            connection.register_notification_handler("y/event", move |_| {
                let _ = seen_tx.send("first");
            });
        }
        connection.register_notification_handler("y/event", move |_| {
            let _ = seen_tx.send("second");
        });

        peer.writer
            .send(&json!({ "jsonrpc": "2.0", "method": "y/event" }))
            .await
            .unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_inbound_request_handler_result_becomes_response() {
        let (connection, mut peer) = pipe();

        connection.register_request_handler("workspace/configuration", |_params| {
            Box::pin(async { Ok(json!([{"check": true}])) })
        });

        peer.writer
            .send(&json!({
                "jsonrpc": "2.0",
                "id": "cfg-1",
                "method": "workspace/configuration",
                "params": { "items": [] }
            }))
            .await
            .unwrap();

        let response = peer.recv().await;
        assert_eq!(response["id"], "cfg-1");
        assert_eq!(response["result"][0]["check"], true);
    }

    #[tokio::test]
    async fn test_inbound_request_handler_error_becomes_error_response() {
        let (connection, mut peer) = pipe();

        connection.register_request_handler("z/fails", |_params| {
            Box::pin(async { Err(ResponseError::new(-32000, "nope")) })
        });

        peer.writer
            .send(&json!({ "jsonrpc": "2.0", "id": 12, "method": "z/fails" }))
            .await
            .unwrap();

        let response = peer.recv().await;
        assert_eq!(response["id"], 12);
        assert_eq!(response["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn test_unhandled_server_request_gets_method_not_found() {
        let (connection, mut peer) = pipe();
        let _connection = connection;

        peer.writer
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 44,
                "method": "client/registerCapability",
                "params": {}
            }))
            .await
            .unwrap();

        let response = peer.recv().await;
        assert_eq!(response["id"], 44);
        assert_eq!(response["error"]["code"], ResponseError::METHOD_NOT_FOUND);
        assert!(
            response["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    #[tokio::test]
    async fn test_transport_close_flips_signal_and_fails_pending() {
        let (connection, peer) = pipe();
        let connection = Arc::new(connection);
        assert!(connection.is_open());
        let mut signal = connection.close_signal();

        let request = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_request("x/doomed", None).await })
        };
        // Let the request land in the pending table before cutting the pipe.
        tokio::task::yield_now().await;

        drop(peer);
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(!connection.is_open());

        assert!(matches!(request.await.unwrap(), Err(RequestError::Closed)));
    }

    #[tokio::test]
    async fn test_lifecycle_wrappers_use_fixed_method_names() {
        let (connection, mut peer) = pipe();
        let connection = Arc::new(connection);

        {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                let _ = connection.initialize(json!({"rootUri": "file:///w"})).await;
            });
        }
        let frame = peer.recv().await;
        assert_eq!(frame["method"], "initialize");
        peer.respond(&frame["id"], json!({"capabilities": {}})).await;

        connection.initialized().await.unwrap();
        assert_eq!(peer.recv().await["method"], "initialized");

        {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                let _ = connection.shutdown().await;
            });
        }
        let frame = peer.recv().await;
        assert_eq!(frame["method"], "shutdown");
        peer.respond(&frame["id"], Value::Null).await;

        connection.exit().await.unwrap();
        assert_eq!(peer.recv().await["method"], "exit");
    }

    #[tokio::test]
    async fn test_document_sync_wrappers() {
        let (connection, mut peer) = pipe();

        connection
            .did_open("file:///w/a.rs", "rust", 1, "fn main() {}")
            .await
            .unwrap();
        let frame = peer.recv().await;
        assert_eq!(frame["method"], "textDocument/didOpen");
        assert_eq!(frame["params"]["textDocument"]["languageId"], "rust");

        connection
            .did_change("file:///w/a.rs", 2, "fn main() { 1; }")
            .await
            .unwrap();
        assert_eq!(peer.recv().await["method"], "textDocument/didChange");

        connection.did_close("file:///w/a.rs").await.unwrap();
        assert_eq!(peer.recv().await["method"], "textDocument/didClose");
    }

    #[tokio::test]
    async fn test_dispose_tears_down_io() {
        let (connection, _peer) = pipe();
        connection.dispose();
        assert!(!connection.is_open());
        assert!(matches!(
            connection.send_request("x/after", None).await,
            Err(RequestError::Closed)
        ));
    }
}
