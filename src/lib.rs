pub mod app;
pub mod blocking;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod gateway;
pub mod http;
mod macros;
pub mod model;
pub mod oauth;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod sync;
