pub mod envelope;
pub mod error;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
