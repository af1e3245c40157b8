//! pinentryd - an Assuan pinentry server on a Unix domain socket.
//!
//! A secret-management client (typically a cryptographic agent) connects
//! to the socket and speaks the small Assuan subset needed for PIN
//! entry: `SETDESC`/`SETPROMPT` to describe the request, `GETPIN` to ask
//! a human for the value, `BYE` to hang up. The daemon answers with the
//! protocol's `OK`/`Err`/`D`/`#` lines, percent-escaping payloads so a
//! secret can never corrupt the line framing.
//!
//! # Architecture
//!
//! ```text
//! agent ──UnixStream──► PinentryServer          PinPrompt capability
//!                         │ accept (max 1)        ▲
//!                         ▼                       │ GETPIN
//!                       serve_connection ─────────┘
//!                         │ assuan codec
//!                         ▼
//!                       OK / Err / D / # lines
//! ```
//!
//! # Modules
//!
//! - [`assuan`] - wire codec (parsing, percent-escaping, responses)
//! - [`connection`] - per-connection command state machine
//! - [`server`] - socket lifecycle: bind, single-connection accept loop,
//!   health supervision, instance handover
//! - [`prompt`] - prompt capability implementation (external command)
//! - [`config`] - settings file and environment overrides

pub mod assuan;
pub mod config;
pub mod connection;
pub mod prompt;
pub mod server;

// Re-export commonly used types
pub use config::Settings;
pub use connection::{Outcome, PinPrompt};
pub use prompt::CommandPrompt;
pub use server::{PinentryServer, ServerConfig, Supervisor};
