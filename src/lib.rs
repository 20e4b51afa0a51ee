//! A line-oriented shell for a single-address-space VM platform.
//!
//! Child programs here are not OS processes: they are raw opcode streams that
//! the shell validates, loads into an owned memory image, and runs on an
//! embedded stack-machine interpreter, reclaiming the image when the child
//! deposits its exit status. Memory budgets are probed empirically and shrink
//! as spawns nest, so the always-resident shell services are never starved.
//!
//! The main entry point is [`Interpreter`], which drives the dispatch loop:
//! restore descriptor redirections left by the previous statement, read and
//! tokenize the next statement, apply its redirections, and execute it: a
//! builtin, a sourced script, or a spawned program image. The public modules
//! [`command`] and [`session`] expose the traits and the session object that
//! every component operates on.

mod builtin;
pub mod command;
mod engines;
mod external;
mod interpreter;
mod lexer;
pub mod parser;
pub mod redirect;
pub mod session;
mod source;
pub mod vm;

pub use command::ExitCode;
pub use engines::{QueryEngine, TemplateEngine};

/// Just a convenient re-export of the interactive command runner.
///
/// See [`Interpreter`] for the high-level API.
pub use interpreter::Interpreter;
