//! Proxy auto-configuration: acquiring, compiling and evaluating PAC scripts.

pub mod builtins;
mod engine;
mod source;

pub use engine::PacEngine;
pub use source::PacSource;
