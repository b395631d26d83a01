use crate::api::{unpack_find_response, Credentials, Record};
use crate::client::transport::{CallRequest, ClientSlot, TransportClient};
use crate::client::types::CallError;
use crate::ws::CallMethod;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::Arc;

/// Path of the server's authentication service.
pub const AUTHENTICATION_PATH: &str = "authentication";

/// A remote call in flight.
pub type CallFuture<T> = BoxFuture<'static, Result<T, CallError>>;

/// Request/response calls against the collections of one server.
///
/// Each call reads the transport slot when it is made: calling before a
/// transport exists fails with [`CallError::NoClient`] right away, and a call
/// in flight keeps using the transport it started on.
#[derive(Clone, Debug)]
pub struct Gateway {
    slot: ClientSlot,
}

impl Gateway {
    pub fn new(slot: ClientSlot) -> Self {
        Self { slot }
    }

    pub fn has_client(&self) -> bool {
        self.slot.is_set()
    }

    pub fn find(&self, path: &str, query: Value) -> CallFuture<Vec<Record>> {
        let request = CallRequest::new(CallMethod::Find, path)
            .with_params(serde_json::json!({ "query": query }));
        let call = self.dispatch(request);
        async move { Ok(unpack_find_response(call.await?)) }.boxed()
    }

    pub fn get(&self, path: &str, id: &str) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Get, path).with_id(Some(id.to_string()));
        self.record_call(request)
    }

    pub fn create(&self, path: &str, data: Record) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Create, path).with_data(Value::Object(data));
        self.record_call(request)
    }

    /// Replace a record entirely.
    pub fn update(&self, path: &str, id: &str, data: Record) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Update, path)
            .with_id(Some(id.to_string()))
            .with_data(Value::Object(data));
        self.record_call(request)
    }

    /// Merge `data` into a record.
    pub fn patch(&self, path: &str, id: &str, data: Record) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Patch, path)
            .with_id(Some(id.to_string()))
            .with_data(Value::Object(data));
        self.record_call(request)
    }

    pub fn remove(&self, path: &str, id: &str) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Remove, path).with_id(Some(id.to_string()));
        self.record_call(request)
    }

    /// Exchange credentials for a session on the current transport.
    pub fn authenticate(&self, credentials: &Credentials) -> CallFuture<Record> {
        let request = CallRequest::new(CallMethod::Create, AUTHENTICATION_PATH)
            .with_data(Value::Object(credentials.to_record()));
        self.record_call(request)
    }

    pub fn logout(&self) -> CallFuture<()> {
        let call = self.dispatch(CallRequest::new(CallMethod::Remove, AUTHENTICATION_PATH));
        async move { call.await.map(|_| ()) }.boxed()
    }

    fn record_call(&self, request: CallRequest) -> CallFuture<Record> {
        let call = self.dispatch(request);
        async move {
            match call.await? {
                Value::Object(record) => Ok(record),
                other => Err(CallError::Decode(format!("expected a record, got {}", other))),
            }
        }
        .boxed()
    }

    fn dispatch(&self, request: CallRequest) -> CallFuture<Value> {
        let client: Option<Arc<dyn TransportClient>> = self.slot.get();
        async move {
            let Some(client) = client else {
                log::warn!("Call to '{}' with no transport", request.path);
                return Err(CallError::NoClient(request.path));
            };
            client.call(request).await
        }
        .boxed()
    }
}
