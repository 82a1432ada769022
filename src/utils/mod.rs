//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Shell command execution with captured output
//! - `io` - File I/O with consistent error handling
//! - `shell` - Shell escaping and quoting
//! - `template` - `{{key}}` template rendering

pub mod command;
pub mod io;
pub mod shell;
pub mod template;
