use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use snare_core::prelude::*;
use snare_utils::{info, init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingGuard};

mod logger;
mod tracer;

/// Live debugging of Windows processes: event logging and function tracing.
#[derive(Parser, Debug)]
#[command(name = "snare")]
#[command(version)]
#[command(about = "Log debug events or trace exported function entries of a Windows process", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (pretty or json); overrides SNARE_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Print one line per debug event until the target exits
    Log
    {
        #[command(flatten)]
        target: Target,
    },
    /// Print every call to an exported function of the loaded images
    Trace
    {
        #[command(flatten)]
        target: Target,
    },
}

/// Process to debug: a running one by PID, or a program to start
#[derive(Args, Debug)]
struct Target
{
    /// Process ID (PID) to attach to
    #[arg(long, conflicts_with = "program")]
    pid: Option<u32>,

    /// Path to the executable to launch
    #[arg(required_unless_present = "pid")]
    program: Option<PathBuf>,

    /// Arguments to pass to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, requires = "program")]
    args: Vec<String>,

    /// Working directory for the launched program
    #[arg(long, requires = "program")]
    cwd: Option<PathBuf>,
}

impl Target
{
    fn start(&self) -> SnareResult<Session>
    {
        let backend = create_backend()?;
        match (self.pid, &self.program) {
            (Some(pid), _) => {
                info!(pid, "attaching");
                Session::attach(backend, ProcessId(pid))
            }
            (None, Some(program)) => {
                let mut options = LaunchOptions::new(program).args(&self.args);
                if let Some(cwd) = &self.cwd {
                    options = options.current_dir(cwd);
                }
                info!(command_line = %options.command_line(), "launching");
                Session::launch(backend, &options)
            }
            (None, None) => Err(SnareError::InvalidArgument(
                "either --pid or a program to launch is required".to_string(),
            )),
        }
    }
}

fn main()
{
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let Cli {
        command,
        log_level,
        log_format,
    } = cli;

    match command {
        Commands::Log { target } => {
            let _guard = console_logging(log_level, log_format)?;
            let session = target.start()?;
            logger::install(&session);
            session.wait()?;
        }
        Commands::Trace { target } => {
            // stdout carries the trace itself
            let (path, _guard) = init_logging_to_file(log_level, log_format.unwrap_or_default())?;
            eprintln!("Logging to {}", path.display());
            let session = target.start()?;
            tracer::install(&session);
            session.wait()?;
        }
    }
    Ok(())
}

fn console_logging(level: Option<LogLevel>, format: Option<LogFormat>) -> Result<LoggingGuard, Box<dyn std::error::Error>>
{
    let guard = match (level, format) {
        (None, None) => init_logging()?,
        (level, format) => init_logging_with_level(level.unwrap_or_default(), format.unwrap_or_default())?,
    };
    Ok(guard)
}
