//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - build: bundle entry points, optionally watching or serving
//! - transform: transform a single file or stdin
//! - analyze: print a size report for a metafile

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

use packwire::build::{Format, Loader, Platform};

/// Packwire - drive an out-of-process bundler from the command line
#[derive(Parser, Debug)]
#[command(name = "packwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Parse a lowercase enum value the same way config files spell it.
fn parse_enum<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("invalid value \"{}\"", value))
}

fn parse_format(value: &str) -> Result<Format, String> {
    parse_enum(value)
}

fn parse_platform(value: &str) -> Result<Platform, String> {
    parse_enum(value)
}

fn parse_loader(value: &str) -> Result<Loader, String> {
    parse_enum(value)
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build one or more entry points
    Build {
        /// Entry point files
        #[arg(required = true)]
        entries: Vec<String>,

        /// Output directory
        #[arg(long)]
        outdir: Option<PathBuf>,

        /// Output file (single entry point only)
        #[arg(long)]
        outfile: Option<PathBuf>,

        /// Bundle imports into the output
        #[arg(long)]
        bundle: bool,

        /// Minify the output
        #[arg(long)]
        minify: bool,

        /// Output format (iife, cjs, esm)
        #[arg(long, value_parser = parse_format)]
        format: Option<Format>,

        /// Target platform (browser, node, neutral)
        #[arg(long, value_parser = parse_platform)]
        platform: Option<Platform>,

        /// Emit linked source maps
        #[arg(long)]
        sourcemap: bool,

        /// Rebuild when input files change
        #[arg(long)]
        watch: bool,

        /// Serve the output on this port
        #[arg(long)]
        serve: Option<u16>,
    },

    /// Transform a single file, or stdin when no file is given
    Transform {
        /// Input file
        file: Option<PathBuf>,

        /// Loader for the input (js, ts, tsx, css, ...)
        #[arg(short, long, value_parser = parse_loader)]
        loader: Option<Loader>,
    },

    /// Print a size report for a metafile
    Analyze {
        /// Metafile written by a build with metafile enabled
        metafile: PathBuf,
    },
}

impl Commands {
    /// Whether this command keeps running until interrupted
    pub fn is_long_running(&self) -> bool {
        matches!(self, Commands::Build { watch: true, .. } | Commands::Build { serve: Some(_), .. })
    }
}
