//! Command line front end for syncstores over a SQLite database

#[cfg(test)]
#[macro_use]
extern crate hamcrest;

pub mod args;
pub mod command;
pub mod error;
pub mod sqlitestorage;

pub use args::{Args, Command};
pub use command::{execute, open_group};
pub use error::CliError;
pub use sqlitestorage::SqliteStorage;
