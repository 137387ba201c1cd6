//! RFC 959 - File Transfer Protocol
//!
//! These tests verify the command surface and end-to-end control/data
//! behaviour of the core protocol.
//! https://datatracker.ietf.org/doc/html/rfc959

mod rfc959 {
    mod commands;
    mod replies;
    mod session;
}
