//! Command-line front end for keycustody.
//!
//! Every command runs the same sequence: initialize the lifecycle, generate or
//! load a key, optionally stream a file through it, and shut down. Failures map
//! to distinct exit codes through [`CliError::exit_code`].

mod args;
mod error;
mod keyfile;
mod run;

pub use args::{Cli, Command};
pub use error::{CliError, Result};
pub use keyfile::KeyFile;
pub use run::run;
