//! ivp-cli library target: the subcommand handlers, exposed so integration
//! tests can call them without spawning the binary.

pub mod backends;
pub mod commands;
