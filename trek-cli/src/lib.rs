//! Trek CLI - Command-line interface for trek.
//!
//! This crate provides the `trek` binary: project scaffolding, migration
//! generation from a declarative model, applying migrations to a running
//! server, and validating a project in CI.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
