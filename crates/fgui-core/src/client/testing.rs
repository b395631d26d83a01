//! Recording transports for tests of the connection, multiplexer and
//! synchronizer layers, and of crates embedding them.

use crate::api::{Record, RecordEvent, ID_FIELD};
use crate::client::id::event_key;
use crate::client::transport::{CallRequest, Connector, EventSink, SignalSender, TransportClient};
use crate::client::types::{CallError, TransportSignal};
use crate::ws::CallMethod;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Responder = Box<dyn Fn(&CallRequest) -> Result<Value, CallError> + Send + Sync>;

/// In-memory transport that records every call and subscription.
///
/// Without a responder, calls echo back a plausible record: `find` answers
/// an empty list, writes answer their payload with the id filled in.
pub struct MockTransport {
    calls: Mutex<Vec<CallRequest>>,
    /// `"listen path:event"` / `"unlisten path:event"` in call order
    subscriptions: Mutex<Vec<String>>,
    sinks: Mutex<HashMap<String, Arc<dyn EventSink>>>,
    responder: Mutex<Option<Responder>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
            responder: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&CallRequest) -> Result<Value, CallError> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Number of `listen` calls made for one key.
    pub fn listen_count(&self, path: &str, event: RecordEvent) -> usize {
        let entry = format!("listen {}", event_key(path, event));
        self.subscriptions.lock().iter().filter(|s| **s == entry).count()
    }

    pub fn is_listening(&self, path: &str, event: RecordEvent) -> bool {
        self.sinks.lock().contains_key(&event_key(path, event))
    }

    pub fn active_listeners(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push a change notification as if it came from the server.
    /// Returns false if nothing is listening for it.
    pub fn emit(&self, path: &str, event: RecordEvent, record: Value) -> bool {
        let sink = self.sinks.lock().get(&event_key(path, event)).cloned();
        match (sink, record.as_object()) {
            (Some(sink), Some(record)) => {
                sink.deliver(record);
                true
            }
            _ => false,
        }
    }

    fn default_response(request: &CallRequest) -> Value {
        match request.method {
            CallMethod::Find => json!([]),
            CallMethod::Get | CallMethod::Remove => json!({ ID_FIELD: request.id }),
            CallMethod::Create | CallMethod::Update | CallMethod::Patch => {
                let mut record: Record = request
                    .data
                    .as_ref()
                    .and_then(|d| d.as_object().cloned())
                    .unwrap_or_default();
                if let Some(id) = &request.id {
                    record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                }
                Value::Object(record)
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn call(&self, request: CallRequest) -> Result<Value, CallError> {
        self.calls.lock().push(request.clone());
        if self.is_closed() {
            return Err(CallError::Closed(request.path));
        }
        match self.responder.lock().as_ref() {
            Some(responder) => responder(&request),
            None => Ok(Self::default_response(&request)),
        }
    }

    fn listen(&self, path: &str, event: RecordEvent, sink: Arc<dyn EventSink>) {
        let key = event_key(path, event);
        self.subscriptions.lock().push(format!("listen {}", key));
        self.sinks.lock().insert(key, sink);
    }

    fn unlisten(&self, path: &str, event: RecordEvent) {
        let key = event_key(path, event);
        self.subscriptions.lock().push(format!("unlisten {}", key));
        self.sinks.lock().remove(&key);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One socket handed out by [`MockConnector`].
#[derive(Clone)]
pub struct OpenedSocket {
    pub url: String,
    pub signals: SignalSender,
    pub transport: Arc<MockTransport>,
}

/// Connector producing [`MockTransport`]s. Signals are raised by the test
/// through [`OpenedSocket::signals`], or automatically with `auto_connect`.
#[derive(Default)]
pub struct MockConnector {
    opened: Mutex<Vec<OpenedSocket>>,
    auto_connect: bool,
    responder: Mutex<Option<Arc<dyn Fn(&CallRequest) -> Result<Value, CallError> + Send + Sync>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every socket reports `Connect` as soon as it is opened.
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// Responder installed on every transport opened from now on.
    pub fn respond_with(
        &self,
        responder: impl Fn(&CallRequest) -> Result<Value, CallError> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn opened(&self) -> Vec<OpenedSocket> {
        self.opened.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn last(&self) -> Option<OpenedSocket> {
        self.opened.lock().last().cloned()
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str, signals: SignalSender) -> Arc<dyn TransportClient> {
        let transport = Arc::new(MockTransport::new());
        if let Some(responder) = self.responder.lock().clone() {
            transport.respond_with(move |request| responder(request));
        }
        if self.auto_connect {
            signals.send(TransportSignal::Connect);
        }
        self.opened.lock().push(OpenedSocket {
            url: url.to_string(),
            signals,
            transport: transport.clone(),
        });
        transport
    }
}
