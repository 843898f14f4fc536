use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use packwire::build::{
    AnalyzeMetafileOptions, BuildOptions, BuildService, FormatMessagesOptions, Loader, ServeOptions, ServeRequest, Sourcemap,
    TransformOptions,
};
use packwire::config::Config;
use packwire::protocol::{Message, MessageKind};
use packwire::{PackwireError, WorkerProcess};

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("packwire")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("packwire.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none()
        && let Some(level) = &config.log_level
    {
        builder.parse_filters(level);
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Print diagnostics the way the worker renders them.
async fn print_messages(service: &BuildService, messages: &[Message], kind: MessageKind) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let options = FormatMessagesOptions {
        kind,
        color: std::io::stderr().is_terminal(),
        terminal_width: None,
    };
    let rendered = service
        .format_messages(messages, options)
        .await
        .context("Failed to format messages")?;
    for text in rendered {
        eprint!("{}", text);
    }
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let worker = WorkerProcess::spawn(&config.worker).context("Failed to start worker")?;
    let service = BuildService::new(worker.channel().clone());

    let outcome = match &cli.command {
        Commands::Build { .. } => handle_build_command(&cli.command, &service, config).await,
        Commands::Transform { file, loader } => handle_transform_command(file.as_deref(), *loader, &service).await,
        Commands::Analyze { metafile } => handle_analyze_command(metafile, cli.is_verbose(), &service).await,
    };

    worker.shutdown().await.context("Failed to stop worker")?;
    outcome
}

fn build_options(command: &Commands, config: &Config) -> BuildOptions {
    let mut options = config.build.clone();
    if let Commands::Build {
        entries,
        outdir,
        outfile,
        bundle,
        minify,
        format,
        platform,
        sourcemap,
        ..
    } = command
    {
        options.entry_points = entries.iter().map(|e| e.as_str().into()).collect();
        if outdir.is_some() {
            options.outdir = outdir.clone();
        }
        if outfile.is_some() {
            options.outfile = outfile.clone();
        }
        options.bundle |= *bundle;
        options.minify |= *minify;
        if format.is_some() {
            options.format = *format;
        }
        if platform.is_some() {
            options.platform = *platform;
        }
        if *sourcemap {
            options.sourcemap = Some(Sourcemap::Linked);
        }
    }
    options
}

async fn handle_build_command(command: &Commands, service: &BuildService, config: &Config) -> Result<()> {
    let options = build_options(command, config);
    info!("Building {} entry point(s)", options.entry_points.len());

    if !command.is_long_running() {
        return match service.build(options).await {
            Ok(result) => {
                print_messages(service, &result.warnings, MessageKind::Warning).await?;
                for file in result.output_files.iter().flatten() {
                    println!("{} {}", "wrote".green(), file.path.display());
                }
                println!("{}", "Build complete".green());
                Ok(())
            }
            Err(PackwireError::BuildFailed(failure)) => {
                print_messages(service, &failure.warnings, MessageKind::Warning).await?;
                print_messages(service, &failure.errors, MessageKind::Error).await?;
                Err(eyre!("Build failed with {} error(s)", failure.errors.len()))
            }
            Err(e) => Err(e).context("Build failed"),
        };
    }

    let context = service.context(options).await.context("Failed to create build context")?;
    if let Commands::Build { serve: Some(port), .. } = command {
        let on_request: Arc<dyn Fn(ServeRequest) + Send + Sync> = Arc::new(|request: ServeRequest| {
            println!("{} {} {} [{}ms]", request.method.cyan(), request.path, request.status, request.time_in_ms);
        });
        let serve_options = ServeOptions {
            host: config.serve.host.clone(),
            port: Some(*port),
            servedir: config.serve.servedir.clone(),
            on_request: Some(on_request),
        };
        let served = context.serve(serve_options).await.context("Failed to start server")?;
        println!("{} http://{}:{}/", "Serving on".green(), served.host, served.port);
    }
    if let Commands::Build { watch: true, .. } = command {
        context.watch().await.context("Failed to start watch mode")?;
        println!("{}", "Watching for changes...".cyan());
    }

    tokio::signal::ctrl_c().await.context("Failed to wait for interrupt")?;
    println!("{}", "Stopping...".yellow());
    context.dispose().await;
    Ok(())
}

fn loader_for(file: Option<&Path>) -> Option<Loader> {
    let ext = file?.extension()?.to_str()?;
    match ext {
        "mjs" | "cjs" => Some(Loader::Js),
        "mts" | "cts" => Some(Loader::Ts),
        other => Loader::parse(other),
    }
}

async fn handle_transform_command(file: Option<&Path>, loader: Option<Loader>, service: &BuildService) -> Result<()> {
    let input = match file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read stdin")?;
            buf
        }
    };

    let mut options = TransformOptions {
        loader: loader.or_else(|| loader_for(file)),
        ..Default::default()
    };
    if let Some(path) = file {
        options.sourcefile = Some(path.display().to_string());
    }

    match service.transform(input, options).await {
        Ok(result) => {
            print_messages(service, &result.warnings, MessageKind::Warning).await?;
            print!("{}", result.code);
            Ok(())
        }
        Err(PackwireError::BuildFailed(failure)) => {
            print_messages(service, &failure.errors, MessageKind::Error).await?;
            Err(eyre!("Transform failed with {} error(s)", failure.errors.len()))
        }
        Err(e) => Err(e).context("Transform failed"),
    }
}

async fn handle_analyze_command(metafile: &Path, verbose: bool, service: &BuildService) -> Result<()> {
    info!("Analyzing metafile: {}", metafile.display());
    let text = tokio::fs::read_to_string(metafile)
        .await
        .with_context(|| format!("Failed to read {}", metafile.display()))?;
    let options = AnalyzeMetafileOptions {
        color: std::io::stdout().is_terminal(),
        verbose,
    };
    let report = service
        .analyze_metafile(&text, options)
        .await
        .context("Failed to analyze metafile")?;
    print!("{}", report);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging
    setup_logging(&config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
