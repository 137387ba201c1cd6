//! Listener supervision, autoban, session registry, and the
//! administration server

pub mod admin_server;
pub mod autoban;
pub mod registry;
pub mod server;

pub use admin_server::{AdminDeps, AdminHub, ServerForwarder};
pub use autoban::AutoBanner;
pub use registry::SessionRegistry;
pub use server::Server;
