use crate::api::RecordEvent;
use crate::client::config::ClientSettings;
use crate::client::id::{event_key, split_event_key};
use crate::client::transport::{CallRequest, Connector, EventSink, SignalSender, TransportClient};
use crate::client::types::{CallError, TransportSignal};
use crate::ws::{ClientFrame, ServerFrame};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WsClient`] sockets on the given runtime.
pub struct WsConnector {
    settings: ClientSettings,
    runtime: Handle,
}

impl WsConnector {
    pub fn new(settings: ClientSettings, runtime: Handle) -> Self {
        Self { settings, runtime }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, signals: SignalSender) -> Arc<dyn TransportClient> {
        WsClient::spawn(url, &self.settings, signals, &self.runtime)
    }
}

/// State shared between the client handle and its socket task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CallError>>>>,
    sinks: Mutex<HashMap<String, Arc<dyn EventSink>>>,
    connected: AtomicBool,
}

impl Shared {
    /// Flip to connected and return the listen frames the server needs to
    /// hear again. Done under the sinks lock so a concurrent `listen` either
    /// lands in this batch or sends its own frame.
    fn mark_connected(&self) -> Vec<ClientFrame> {
        let sinks = self.sinks.lock();
        self.connected.store(true, Ordering::SeqCst);
        sinks
            .keys()
            .filter_map(|key| split_event_key(key))
            .map(|(path, event)| ClientFrame::Listen {
                path: path.to_string(),
                event,
            })
            .collect()
    }

    fn fail_pending(&self, url: &str) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            log::debug!("Failing {} pending calls to {}", pending.len(), url);
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(CallError::Closed(url.to_string())));
        }
    }

    fn resolve(&self, id: u64, result: Result<Value, CallError>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => log::debug!("Response for unknown call {}", id),
        }
    }

    fn handle_text(&self, text: &str) {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Result { id, result }) => self.resolve(id, Ok(result)),
            Ok(ServerFrame::Error { id, error }) => self.resolve(id, Err(CallError::Remote(error))),
            Ok(ServerFrame::Event { path, event, data }) => self.dispatch_event(&path, event, data),
            Err(e) => log::warn!("Failed to parse server frame: {}", e),
        }
    }

    fn dispatch_event(&self, path: &str, event: RecordEvent, data: Value) {
        let sink = self.sinks.lock().get(&event_key(path, event)).cloned();
        match (sink, data) {
            (Some(sink), Value::Object(record)) => sink.deliver(&record),
            (None, _) => log::debug!("Dropping {} event for {}: not listening", event, path),
            (Some(_), other) => {
                log::warn!("Dropping {} event for {}: not a record: {}", event, path, other);
            }
        }
    }
}

/// Socket transport over tokio-tungstenite.
///
/// The socket task keeps retrying the connect until one succeeds, raising
/// `ConnectError`/`ConnectTimeout` per failed attempt. Once a session ends
/// it raises `Disconnect` and stops; reconnecting is the state machine's job.
pub struct WsClient {
    url: String,
    outbound: async_channel::Sender<ClientFrame>,
    shared: Arc<Shared>,
    next_call_id: AtomicU64,
    task: Mutex<Option<tokio::task::AbortHandle>>,
}

impl WsClient {
    pub fn spawn(
        url: &str,
        settings: &ClientSettings,
        signals: SignalSender,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let shared = Arc::new(Shared::default());
        let task = runtime.spawn(run_socket(
            url.to_string(),
            settings.clone(),
            signals,
            outbound_rx,
            shared.clone(),
        ));
        Arc::new(Self {
            url: url.to_string(),
            outbound: outbound_tx,
            shared,
            next_call_id: AtomicU64::new(1),
            task: Mutex::new(Some(task.abort_handle())),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportClient for WsClient {
    async fn call(&self, request: CallRequest) -> Result<Value, CallError> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let path = request.path.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let frame = ClientFrame::Call {
            id,
            method: request.method,
            path: request.path,
            record_id: request.id,
            data: request.data,
            params: request.params,
        };
        if self.outbound.try_send(frame).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(CallError::Closed(path));
        }
        rx.await.unwrap_or(Err(CallError::Closed(path)))
    }

    fn listen(&self, path: &str, event: RecordEvent, sink: Arc<dyn EventSink>) {
        let mut sinks = self.shared.sinks.lock();
        sinks.insert(event_key(path, event), sink);
        if self.shared.connected.load(Ordering::SeqCst) {
            let _ = self.outbound.try_send(ClientFrame::Listen {
                path: path.to_string(),
                event,
            });
        }
    }

    fn unlisten(&self, path: &str, event: RecordEvent) {
        let mut sinks = self.shared.sinks.lock();
        let removed = sinks.remove(&event_key(path, event)).is_some();
        if removed && self.shared.connected.load(Ordering::SeqCst) {
            let _ = self.outbound.try_send(ClientFrame::Unlisten {
                path: path.to_string(),
                event,
            });
        }
    }

    fn close(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.outbound.close();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fail_pending(&self.url);
        log::debug!("Closed socket to {}", self.url);
    }
}

async fn run_socket(
    url: String,
    settings: ClientSettings,
    signals: SignalSender,
    outbound: async_channel::Receiver<ClientFrame>,
    shared: Arc<Shared>,
) {
    loop {
        let attempt = tokio::time::timeout(
            settings.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let delivered = match attempt.await {
            Ok(Ok((stream, _response))) => {
                log::info!("Socket connected to {}", url);
                let reason = run_session(stream, &outbound, &shared, &signals).await;
                log::info!("Socket to {} ended: {}", url, reason);
                shared.connected.store(false, Ordering::SeqCst);
                shared.fail_pending(&url);
                signals.send(TransportSignal::Disconnect);
                return;
            }
            Ok(Err(e)) => {
                log::warn!("Connect to {} failed: {}", url, e);
                signals.send(TransportSignal::ConnectError(e.to_string()))
            }
            Err(_) => {
                log::warn!("Connect to {} timed out after {:?}", url, settings.connect_timeout());
                signals.send(TransportSignal::ConnectTimeout)
            }
        };
        if !delivered {
            // Nobody is listening for this socket anymore
            return;
        }
        tokio::time::sleep(settings.reconnect_delay()).await;
    }
}

/// One established session. Returns why it ended.
async fn run_session(
    stream: WsStream,
    outbound: &async_channel::Receiver<ClientFrame>,
    shared: &Shared,
    signals: &SignalSender,
) -> String {
    let (mut write, mut read) = stream.split();

    for frame in shared.mark_connected() {
        if let Err(e) = write.send(Message::Text(frame.to_text().into())).await {
            return format!("failed to restore listeners: {}", e);
        }
    }
    signals.send(TransportSignal::Connect);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Ok(frame) => {
                    if let Err(e) = write.send(Message::Text(frame.to_text().into())).await {
                        return format!("write failed: {}", e);
                    }
                }
                Err(_) => {
                    let _ = write.send(Message::Close(None)).await;
                    return "client closed".to_string();
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(_))) => return "server closed connection".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("socket error: {}", e),
                None => return "stream ended".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Record;
    use crate::ws::CallMethod;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct ChannelSink(async_channel::Sender<Record>);

    impl EventSink for ChannelSink {
        fn deliver(&self, record: &Record) {
            let _ = self.0.try_send(record.clone());
        }
    }

    fn fast_settings() -> ClientSettings {
        ClientSettings {
            connect_timeout_ms: 2_000,
            reconnect_delay_ms: 10,
            ..ClientSettings::default()
        }
    }

    fn server_text(frame: &ServerFrame) -> Message {
        Message::Text(serde_json::to_string(frame).unwrap().into())
    }

    /// Accepts one socket. Answers `get` with a record, any other call with
    /// a NotFound error, and every listen with one matching event.
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let reply = match serde_json::from_str::<ClientFrame>(&text).unwrap() {
                    ClientFrame::Call {
                        id,
                        method: CallMethod::Get,
                        record_id,
                        ..
                    } => ServerFrame::Result {
                        id,
                        result: json!({"_id": record_id, "name": "x"}),
                    },
                    ClientFrame::Call { id, .. } => ServerFrame::Error {
                        id,
                        error: crate::api::ServiceError::new("NotFound", "No record", 404),
                    },
                    ClientFrame::Listen { path, event } => ServerFrame::Event {
                        path,
                        event,
                        data: json!({"_id": "pushed"}),
                    },
                    _ => continue,
                };
                if ws.send(server_text(&reply)).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn calls_and_restored_listeners() {
        let _ = env_logger::builder().is_test(true).try_init();
        let url = spawn_server().await;
        let (signal_tx, signal_rx) = async_channel::unbounded();
        let signals = SignalSender::new(3, signal_tx);
        let client = WsClient::spawn(&url, &fast_settings(), signals, &Handle::current());

        // Registered before the socket is up; sent on connect.
        let (event_tx, event_rx) = async_channel::unbounded();
        client.listen("items", RecordEvent::Created, Arc::new(ChannelSink(event_tx)));

        assert_eq!(signal_rx.recv().await.unwrap(), (3, TransportSignal::Connect));
        let pushed = event_rx.recv().await.unwrap();
        assert_eq!(pushed["_id"], json!("pushed"));

        let record = client
            .call(CallRequest::new(CallMethod::Get, "items").with_id(Some("a".into())))
            .await
            .unwrap();
        assert_eq!(record, json!({"_id": "a", "name": "x"}));

        let err = client
            .call(CallRequest::new(CallMethod::Remove, "items").with_id(Some("a".into())))
            .await
            .unwrap_err();
        assert_eq!(err.to_service_error().code, 404);

        client.close();
        let err = client.call(CallRequest::new(CallMethod::Find, "items")).await.unwrap_err();
        assert_eq!(err, CallError::Closed("items".into()));
    }

    #[tokio::test]
    async fn server_close_raises_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let (signal_tx, signal_rx) = async_channel::unbounded();
        let signals = SignalSender::new(1, signal_tx);
        let client = WsClient::spawn(&url, &fast_settings(), signals, &Handle::current());
        assert_eq!(signal_rx.recv().await.unwrap().1, TransportSignal::Connect);
        assert_eq!(signal_rx.recv().await.unwrap().1, TransportSignal::Disconnect);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn refused_connect_retries_with_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (signal_tx, signal_rx) = async_channel::unbounded();
        let signals = SignalSender::new(1, signal_tx);
        let client = WsClient::spawn(&url, &fast_settings(), signals, &Handle::current());
        for _ in 0..2 {
            let (_, signal) = signal_rx.recv().await.unwrap();
            assert!(matches!(signal, TransportSignal::ConnectError(_)), "{:?}", signal);
        }
        client.close();
    }
}
