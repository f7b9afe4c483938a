pub mod connection;
pub mod events;
pub mod request;
pub mod server;
