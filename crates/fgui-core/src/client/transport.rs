use crate::api::{Record, RecordEvent};
use crate::client::types::{CallError, TransportSignal};
use crate::ws::CallMethod;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

/// One request/response call against a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct CallRequest {
    pub method: CallMethod,
    pub path: String,
    pub id: Option<String>,
    pub data: Option<Value>,
    pub params: Option<Value>,
}

impl CallRequest {
    pub fn new(method: CallMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            id: None,
            data: None,
            params: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Receiver of change notifications for one `(path, event)` subscription.
pub trait EventSink: Send + Sync {
    fn deliver(&self, record: &Record);
}

/// A live transport to one server.
///
/// `listen` replaces any sink already registered for the same key, so the
/// transport holds at most one subscription per `(path, event)`.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn call(&self, request: CallRequest) -> Result<Value, CallError>;
    fn listen(&self, path: &str, event: RecordEvent, sink: Arc<dyn EventSink>);
    fn unlisten(&self, path: &str, event: RecordEvent);
    /// Stop the socket. No further signals are raised after this returns.
    fn close(&self);
}

/// Opens transports. One call produces one socket that starts connecting
/// immediately and reports progress through `signals`.
pub trait Connector: Send + Sync {
    fn open(&self, url: &str, signals: SignalSender) -> Arc<dyn TransportClient>;
}

/// Signal channel handed to a single socket, stamped with that socket's
/// generation so the state machine can drop signals from sockets it has
/// already torn down.
#[derive(Clone, Debug)]
pub struct SignalSender {
    generation: u64,
    tx: async_channel::Sender<(u64, TransportSignal)>,
}

impl SignalSender {
    pub fn new(generation: u64, tx: async_channel::Sender<(u64, TransportSignal)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving state machine is gone.
    pub fn send(&self, signal: TransportSignal) -> bool {
        self.tx.try_send((self.generation, signal)).is_ok()
    }
}

/// The single mutable transport handle of a server. Written only by the
/// state machine, read by the gateway and the multiplexer.
#[derive(Clone, Default)]
pub struct ClientSlot(Arc<RwLock<Option<Arc<dyn TransportClient>>>>);

impl ClientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn TransportClient>> {
        self.0.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }

    pub(crate) fn set(&self, client: Arc<dyn TransportClient>) {
        *self.0.write() = Some(client);
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn TransportClient>> {
        self.0.write().take()
    }
}

impl std::fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientSlot").field(&self.is_set()).finish()
    }
}
