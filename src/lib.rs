#![warn(missing_docs)]
//! msgscript is a message-driven function-execution broker: it subscribes
//! to a publish/subscribe bus on a wildcard, matches each message's subject
//! against a store of user-supplied scripts, runs every matching script in
//! an isolated runtime (embedded interpreter, WASI sandbox, or one-shot
//! container), and publishes an aggregated reply. An HTTP gateway lets the
//! same scripts serve web clients.

pub mod config;
pub mod dispatch;
pub mod executor;
pub mod gateway;
pub mod models;
pub mod store;
pub mod supervisor;
pub mod telemetry;
