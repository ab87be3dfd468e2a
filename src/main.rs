use anyhow::{Context, Result};
use argh::FromArgs;
use proc_shell::resolver::SearchPath;
use proc_shell::{Environment, Interpreter};
use std::ffi::OsStr;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// Run executables from the search path as composable processes.
/// Starts an interactive session unless a command is given.
struct Cli {
    #[argh(option, short = 'c')]
    /// run one whitespace-separated command line and exit with its status.
    command: Option<String>,

    #[argh(option)]
    /// colon-separated search path to use instead of $PATH.
    path: Option<String>,
}

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let search_path = match &cli.path {
        Some(path) => SearchPath::parse(OsStr::new(path)),
        None => SearchPath::from_env(),
    };
    let mut sh = Interpreter::new(Environment::with_search_path(search_path));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    match cli.command {
        Some(line) => {
            let code = runtime.block_on(sh.execute_line(&line))?;
            Ok(ExitCode::from(code.clamp(0, 255) as u8))
        }
        None => {
            sh.repl(&runtime)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
