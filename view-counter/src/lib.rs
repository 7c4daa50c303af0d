pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod decode;
pub mod emit;
pub mod metrics_consts;
pub mod source;
pub mod store;
pub mod types;
