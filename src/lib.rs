// ABOUTME: OData <-> PostgreSQL sync engine library
// ABOUTME: Windowed pulls into tables and verified, duplicate-safe pushes from tables

pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod filter;
pub mod ident;
pub mod logging;
pub mod mapper;
pub mod pull;
pub mod push;
pub mod remote;
pub mod runner;
pub mod target;
pub mod verify;

pub use error::SyncError;
pub use runner::{JobRunner, RunOutcome};
