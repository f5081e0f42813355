pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod library;
pub mod liveness;
pub mod mesh;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod registry;
#[cfg(test)]
pub mod testing;
pub mod timers;
pub mod transfer;
