//! Thin translator between CLI flags and `ktl_core`. No engine behavior
//! lives here: every operation below just builds the right `ktl_core` option
//! struct and calls straight through.

pub mod cli;
pub mod keys;
pub mod runner;
pub mod shell_helm;
pub mod verify;

pub use cli::{Cli, Command};
