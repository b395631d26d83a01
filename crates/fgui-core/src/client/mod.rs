pub mod config;
pub mod connection;
pub mod gateway;
pub mod id;
pub mod listeners;
pub mod machine;
pub mod socket;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use config::ClientSettings;
pub use connection::{spawn_server, ServerConnection, ServerHandle};
pub use gateway::{CallFuture, Gateway, AUTHENTICATION_PATH};
pub use id::{event_key, split_event_key};
pub use listeners::{EventMultiplexer, Listener, ListenerId};
pub use machine::{transition, Phase, Trigger};
pub use socket::{WsClient, WsConnector};
pub use transport::{CallRequest, ClientSlot, Connector, EventSink, SignalSender, TransportClient};
pub use types::{CallError, ServerEvent, ServerFault, ServerStatus, TransportSignal};
