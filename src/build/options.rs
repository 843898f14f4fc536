//! Build and transform options
//!
//! Options are one statically typed record per call. `validate()` is run once
//! at the call boundary and rejects every unsupported combination; after
//! that the record is flattened into the worker's command-line flag
//! spelling plus a few structured request fields.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{PackwireError, Result};
use crate::plugin::Plugins;
use crate::protocol::messages::keyed_request;
use crate::protocol::{Commands, Map, Value};

/// Output module format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Iife,
    Cjs,
    Esm,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iife => "iife",
            Self::Cjs => "cjs",
            Self::Esm => "esm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Browser,
    Node,
    Neutral,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Node => "node",
            Self::Neutral => "neutral",
        }
    }
}

/// Source map mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sourcemap {
    Linked,
    External,
    Inline,
    Both,
}

impl Sourcemap {
    fn flag(&self) -> String {
        match self {
            Self::Linked => "--sourcemap".to_string(),
            Self::External => "--sourcemap=external".to_string(),
            Self::Inline => "--sourcemap=inline".to_string(),
            Self::Both => "--sourcemap=both".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Silent => "silent",
        }
    }
}

/// How the worker interprets a file's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loader {
    Js,
    Jsx,
    Ts,
    Tsx,
    Css,
    Json,
    Text,
    Base64,
    Dataurl,
    File,
    Binary,
    Copy,
    Empty,
    Default,
}

impl Loader {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Jsx => "jsx",
            Self::Ts => "ts",
            Self::Tsx => "tsx",
            Self::Css => "css",
            Self::Json => "json",
            Self::Text => "text",
            Self::Base64 => "base64",
            Self::Dataurl => "dataurl",
            Self::File => "file",
            Self::Binary => "binary",
            Self::Copy => "copy",
            Self::Empty => "empty",
            Self::Default => "default",
        }
    }

    /// Parse a loader name as written on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

/// One entry point: a bare path, or an input with an explicit output name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryPoint {
    Path(String),
    Mapped {
        #[serde(rename = "in")]
        input: String,
        out: String,
    },
}

impl EntryPoint {
    pub fn input(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Mapped { input, .. } => input,
        }
    }

    /// `[out, in]` as the worker expects; `out` is empty for bare paths.
    fn to_value(&self) -> Value {
        match self {
            Self::Path(path) => Value::from(vec![String::new(), path.clone()]),
            Self::Mapped { input, out } => Value::from(vec![out.clone(), input.clone()]),
        }
    }
}

impl From<&str> for EntryPoint {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

impl From<String> for EntryPoint {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

/// Build input given as text instead of a file on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StdinOptions {
    pub contents: String,
    pub resolve_dir: Option<PathBuf>,
    pub sourcefile: Option<String>,
    pub loader: Option<Loader>,
}

/// A mangle cache entry: the chosen name, or `false` to keep a property
/// unmangled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MangleValue {
    Name(String),
    Flag(bool),
}

impl MangleValue {
    fn to_value(&self) -> Value {
        match self {
            Self::Name(name) => Value::from(name),
            Self::Flag(flag) => Value::Bool(*flag),
        }
    }

    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Some(Self::Name(name.clone())),
            Value::Bool(false) => Some(Self::Flag(false)),
            _ => None,
        }
    }
}

pub type MangleCache = BTreeMap<String, MangleValue>;

fn validate_mangle_cache(cache: &Option<MangleCache>) -> Result<()> {
    for (key, value) in cache.iter().flatten() {
        if matches!(value, MangleValue::Flag(true)) {
            return Err(PackwireError::InvalidOption(format!(
                "Expected \"mangleCache\" value for \"{}\" to be a string or false",
                key
            )));
        }
    }
    Ok(())
}

fn mangle_cache_value(cache: &MangleCache) -> Value {
    Value::Map(cache.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BuildOptions {
    pub entry_points: Vec<EntryPoint>,
    pub stdin: Option<StdinOptions>,
    pub bundle: bool,
    pub minify: bool,
    pub sourcemap: Option<Sourcemap>,
    pub format: Option<Format>,
    pub platform: Option<Platform>,
    pub target: Vec<String>,
    pub outdir: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    pub outbase: Option<PathBuf>,
    pub external: Vec<String>,
    pub define: BTreeMap<String, String>,
    /// Keyed by extension including the dot, e.g. `.svg`
    pub loader: BTreeMap<String, Loader>,
    pub metafile: bool,
    /// When false the worker returns output files instead of writing them
    pub write: bool,
    pub splitting: bool,
    pub log_level: Option<LogLevel>,
    pub abs_working_dir: Option<PathBuf>,
    pub node_paths: Vec<PathBuf>,
    pub mangle_cache: Option<MangleCache>,
    #[serde(skip)]
    pub plugins: Plugins,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            stdin: None,
            bundle: false,
            minify: false,
            sourcemap: None,
            format: None,
            platform: None,
            target: Vec::new(),
            outdir: None,
            outfile: None,
            outbase: None,
            external: Vec::new(),
            define: BTreeMap::new(),
            loader: BTreeMap::new(),
            metafile: false,
            write: true,
            splitting: false,
            log_level: None,
            abs_working_dir: None,
            node_paths: Vec::new(),
            mangle_cache: None,
            plugins: Plugins::default(),
        }
    }
}

impl BuildOptions {
    /// Options for the given entry points, everything else default.
    pub fn with_entry_points<I, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntryPoint>,
    {
        Self {
            entry_points: entries.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Reject unsupported option combinations.
    pub fn validate(&self) -> Result<()> {
        if self.outfile.is_some() && self.outdir.is_some() {
            return Err(PackwireError::InvalidOption(
                "Cannot use both \"outfile\" and \"outdir\"".to_string(),
            ));
        }
        if self.splitting {
            if self.outdir.is_none() {
                return Err(PackwireError::InvalidOption(
                    "\"splitting\" requires \"outdir\"".to_string(),
                ));
            }
            if self.format != Some(Format::Esm) {
                return Err(PackwireError::InvalidOption(
                    "\"splitting\" currently only works with the \"esm\" format".to_string(),
                ));
            }
        }
        for (index, entry) in self.entry_points.iter().enumerate() {
            if entry.input().is_empty() {
                return Err(PackwireError::InvalidOption(format!(
                    "Entry point at index {} must not be empty",
                    index
                )));
            }
        }
        if let Some(dir) = &self.abs_working_dir
            && !dir.is_absolute()
        {
            return Err(PackwireError::InvalidOption(format!(
                "\"absWorkingDir\" must be an absolute path, got {}",
                dir.display()
            )));
        }
        validate_mangle_cache(&self.mangle_cache)
    }

    /// Flatten into the worker's command-line flag spelling.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.bundle {
            flags.push("--bundle".to_string());
        }
        if self.minify {
            flags.push("--minify".to_string());
        }
        if let Some(sourcemap) = &self.sourcemap {
            flags.push(sourcemap.flag());
        }
        if let Some(format) = &self.format {
            flags.push(format!("--format={}", format.as_str()));
        }
        if let Some(platform) = &self.platform {
            flags.push(format!("--platform={}", platform.as_str()));
        }
        if !self.target.is_empty() {
            flags.push(format!("--target={}", self.target.join(",")));
        }
        if let Some(outdir) = &self.outdir {
            flags.push(format!("--outdir={}", outdir.display()));
        }
        if let Some(outfile) = &self.outfile {
            flags.push(format!("--outfile={}", outfile.display()));
        }
        if let Some(outbase) = &self.outbase {
            flags.push(format!("--outbase={}", outbase.display()));
        }
        for name in &self.external {
            flags.push(format!("--external:{}", name));
        }
        for (key, value) in &self.define {
            flags.push(format!("--define:{}={}", key, value));
        }
        for (ext, loader) in &self.loader {
            flags.push(format!("--loader:{}={}", ext, loader.as_str()));
        }
        if self.metafile {
            flags.push("--metafile".to_string());
        }
        if self.splitting {
            flags.push("--splitting".to_string());
        }
        if let Some(level) = &self.log_level {
            flags.push(format!("--log-level={}", level.as_str()));
        }
        if let Some(stdin) = &self.stdin {
            if let Some(sourcefile) = &stdin.sourcefile {
                flags.push(format!("--sourcefile={}", sourcefile));
            }
            if let Some(loader) = &stdin.loader {
                flags.push(format!("--loader={}", loader.as_str()));
            }
        }
        flags
    }

    /// The `build` request for these options, without plugin registrations.
    pub(crate) fn to_request(&self, key: u32, context: bool) -> Result<Map> {
        self.validate()?;

        let mut request = keyed_request(Commands::BUILD, key)
            .with(
                "entries",
                Value::Array(self.entry_points.iter().map(EntryPoint::to_value).collect()),
            )
            .with("flags", self.to_flags())
            .with("write", self.write)
            .with("context", context);

        if let Some(stdin) = &self.stdin {
            request.insert("stdinContents", Bytes::copy_from_slice(stdin.contents.as_bytes()));
            if let Some(dir) = &stdin.resolve_dir {
                request.insert("stdinResolveDir", dir.display().to_string());
            }
        }
        if let Some(dir) = &self.abs_working_dir {
            request.insert("absWorkingDir", dir.display().to_string());
        }
        if !self.node_paths.is_empty() {
            let paths: Vec<String> = self.node_paths.iter().map(|p| p.display().to_string()).collect();
            request.insert("nodePaths", paths);
        }
        if let Some(cache) = &self.mangle_cache {
            request.insert("mangleCache", mangle_cache_value(cache));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TransformOptions {
    pub loader: Option<Loader>,
    pub sourcefile: Option<String>,
    pub format: Option<Format>,
    pub target: Vec<String>,
    pub minify: bool,
    pub sourcemap: Option<Sourcemap>,
    pub define: BTreeMap<String, String>,
    pub log_level: Option<LogLevel>,
    pub mangle_cache: Option<MangleCache>,
}

impl TransformOptions {
    pub fn with_loader(loader: Loader) -> Self {
        Self {
            loader: Some(loader),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_mangle_cache(&self.mangle_cache)
    }

    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(loader) = &self.loader {
            flags.push(format!("--loader={}", loader.as_str()));
        }
        if let Some(sourcefile) = &self.sourcefile {
            flags.push(format!("--sourcefile={}", sourcefile));
        }
        if let Some(format) = &self.format {
            flags.push(format!("--format={}", format.as_str()));
        }
        if !self.target.is_empty() {
            flags.push(format!("--target={}", self.target.join(",")));
        }
        if self.minify {
            flags.push("--minify".to_string());
        }
        if let Some(sourcemap) = &self.sourcemap {
            flags.push(sourcemap.flag());
        }
        for (key, value) in &self.define {
            flags.push(format!("--define:{}={}", key, value));
        }
        if let Some(level) = &self.log_level {
            flags.push(format!("--log-level={}", level.as_str()));
        }
        flags
    }

    pub(crate) fn to_request(&self, input: Bytes) -> Result<Map> {
        self.validate()?;
        let mut request = crate::protocol::messages::request(Commands::TRANSFORM)
            .with("flags", self.to_flags())
            .with("input", input)
            .with("inputFS", false);
        if let Some(cache) = &self.mangle_cache {
            request.insert("mangleCache", mangle_cache_value(cache));
        }
        Ok(request)
    }
}
