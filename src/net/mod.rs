// Network layer module
// WebSocket and line-JSON TCP transports plus the HTTP diagnostics surface

pub mod connection;
pub mod http;
pub mod json_client;
pub mod listener;
pub mod messages;
pub mod websocket;

pub use connection::Connection;
pub use json_client::JsonClient;
pub use listener::TcpServer;
pub use messages::{ClientMessage, ServerMessage};
