//! CLI module for packwire - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for building,
//! transforming and analyzing metafiles through the worker.

pub mod commands;

pub use commands::Cli;
