pub mod auth;
pub mod bus;
pub mod client;
pub mod envelope;
pub mod events;
pub mod local;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod relay_transport;
pub mod storage;
