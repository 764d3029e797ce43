mod cmd_hook;
mod cmd_reset;
mod cmd_signal;
mod cmd_status;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Conditional verification gate for coding agents")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hook entrypoint (reads the hook payload from stdin)
    Hook {
        /// Event name, for hosts that send no payload (git pre-commit: PreCommit)
        #[arg(long)]
        event: Option<String>,
    },
    /// Show churn, failures and last result per configured task
    Status {
        /// Session whose failures and log to show
        #[arg(long)]
        session: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every churn ref and all session state for this project
    Reset,
    /// Raise a signal that `when.signal` tasks wait for
    Signal {
        /// Session to signal
        #[arg(long)]
        session: String,
        /// Signal type (matched against `when.signal`)
        kind: String,
        /// Free-form note stored with the signal
        message: Option<String>,
    },
}

/// Diagnostics go to stderr so hook stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("TOLLGATE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    match cli.cmd {
        Command::Hook { event } => cmd_hook::execute(event.as_deref()),
        Command::Status { session, json } => cmd_status::execute(&repo_root, session.as_deref(), json),
        Command::Reset => cmd_reset::execute(&repo_root),
        Command::Signal {
            session,
            kind,
            message,
        } => cmd_signal::execute(&repo_root, &session, &kind, message.as_deref()),
    }
}
