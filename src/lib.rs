pub mod broker;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod fanout;
pub mod filter;
pub mod geodesy;
pub mod heartbeat;
pub mod net;
pub mod record;
pub mod registry;
pub mod relay;
pub mod stats;
pub mod store;
