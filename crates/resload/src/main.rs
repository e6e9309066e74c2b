//! Resload.
//!
//! A command line front-end for the keyed resource loader. It loads resources from a directory
//! through the memory and disk caches and reports what happened to every key.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            resload_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
