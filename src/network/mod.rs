pub mod gossip;
pub mod manager;
pub mod message;
pub mod server;
pub mod session;
pub mod wire;
