//! CLI for MicroPython boards over the raw REPL.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod device;
mod fs;
mod repl;
mod session;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use replink_proto::control::RebootMode;
use tracing_subscriber::EnvFilter;

use crate::fs::Edit;
use crate::session::{ConnectArgs, Session};

#[derive(Parser)]
#[command(name = "replink", version, about = "Talk to MicroPython boards over the raw REPL")]
struct Cli {
    #[command(flatten)]
    conn: ConnectArgs,

    /// More log output on stderr (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute Python code on the board and print its output.
    Exec {
        /// Code to run.
        code: String,
    },

    /// Run a host script on the board without copying it to flash.
    Run {
        /// Script to run.
        file: PathBuf,

        /// Soft reboot before running.
        #[arg(long)]
        soft_reboot: bool,
    },

    /// Print a device file.
    Cat {
        /// Device path.
        path: String,
    },

    /// Copy a device file to the host.
    Get {
        /// Device path.
        remote: String,
        /// Host path or directory. Defaults to the file name.
        local: Option<PathBuf>,
    },

    /// Copy a host file to the device.
    Put(fs::PutArgs),

    /// List the device filesystem.
    Ls {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show filesystem usage.
    Df {
        /// Any path on the mount to inspect.
        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a directory and its parents.
    Mkdir {
        /// Device path.
        path: String,
    },

    /// Remove a file.
    Rm {
        /// Device path.
        path: String,
    },

    /// Remove an empty directory.
    Rmdir {
        /// Device path.
        path: String,
    },

    /// Create an empty file if it does not exist.
    Touch {
        /// Device path.
        path: String,
    },

    /// Show firmware and board details.
    Info {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print a markdown report of the board.
    Sysinfo,

    /// Reboot the board.
    Reboot {
        /// soft, hard or bootloader.
        #[arg(default_value = "hard")]
        mode: RebootMode,
    },

    /// Interactive REPL passthrough.
    Repl,

    /// List serial ports.
    Ports {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Print a fresh connection id for `rtc` endpoints.
    Id,

    /// Generate shell completion script.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list and inspect commands.
#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("replink: {e:#}");
        std::process::exit(1);
    }
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Log level for a `-v` count.
const fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Id => {
                device::id();
                return Ok(());
            }
            Command::Ports { format } => return device::ports(format),
            Command::Completion { shell } => {
                let mut cmd = Self::command();
                clap_complete::generate(shell, &mut cmd, "replink", &mut std::io::stdout());
                return Ok(());
            }
            _ => {}
        }

        let session = Session::open(&self.conn).await?;
        let res = run(&session, self.command).await;
        session.close().await;
        res
    }
}

/// Runs a command that needs a connected board.
async fn run(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Exec { code } => repl::exec(session, &code).await,
        Command::Run { file, soft_reboot } => repl::run(session, &file, soft_reboot).await,
        Command::Cat { path } => fs::cat(session, &path).await,
        Command::Get { remote, local } => fs::get(session, &remote, local.as_deref()).await,
        Command::Put(args) => fs::put(session, &args).await,
        Command::Ls { format } => fs::ls(session, format).await,
        Command::Df { path } => fs::df(session, &path).await,
        Command::Mkdir { path } => fs::edit(session, Edit::Mkdir, &path).await,
        Command::Rm { path } => fs::edit(session, Edit::Rm, &path).await,
        Command::Rmdir { path } => fs::edit(session, Edit::Rmdir, &path).await,
        Command::Touch { path } => fs::edit(session, Edit::Touch, &path).await,
        Command::Info { format } => device::info(session, format).await,
        Command::Sysinfo => device::sysinfo(session).await,
        Command::Reboot { mode } => device::reboot(session, mode).await,
        Command::Repl => repl::interactive(session).await,
        Command::Id | Command::Ports { .. } | Command::Completion { .. } => Ok(()),
    }
}
