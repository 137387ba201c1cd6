//! FTP protocol: commands, replies, the per-connection session state
//! machine, data connections, listings, and the TYPE A translation layer

pub mod ascii;
pub mod banner;
pub mod commands;
pub mod data;
pub mod listing;
pub mod replies;
pub mod session;

pub use ascii::AsciiLayer;
pub use commands::Command;
pub use replies::{codes, Reply};
pub use session::{
    serve, NullEvents, PrefixedStream, SessionContext, SessionEvents, SERVER_VERSION,
};
