//! Stdio host for the LingAI model worker.
//!
//! The worker runs beside a controlling process and talks to it in JSON Lines:
//! one request per line on stdin, one response per line on stdout. Logs go to
//! stderr and optionally a file.

pub mod logging;
pub mod stdio;

pub use logging::setup_logging;
pub use stdio::{serve, spawn_line_reader, write_responses, ServeSummary};
