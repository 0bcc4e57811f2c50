#![recursion_limit = "384"]

pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod helper_process;
pub mod rib;
pub mod session;
pub mod utils;
