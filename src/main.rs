use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use librarian::config::Config;
use librarian::git::GitOps;
use librarian::{maintenance, messaging, producer, update};

#[derive(Parser)]
#[command(name = "librarian", version, about = "Keeps a tree of configuration-management environments in sync with a fleet of Git repositories")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/librarian/librarian.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation pass
    Update,
    /// Serve the GitLab webhook that queues update hints
    Producer {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8000")]
        bind: String,
    },
    /// Inspect or drain the hint queue
    Hints {
        #[command(subcommand)]
        command: HintsCommand,
    },
    /// Garbage-collect every bare and clone
    Gc {
        #[arg(long)]
        aggressive: bool,
    },
}

#[derive(Subcommand)]
enum HintsCommand {
    /// Print the number of queued hints
    Count,
    /// Discard every queued hint
    Purge,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("unable to load configuration")?;

    match cli.command {
        Command::Update => update::run(&config),
        Command::Producer { bind } => producer::serve(&config, &bind),
        Command::Hints { command } => match command {
            HintsCommand::Count => {
                println!("{}", messaging::count_pending_hints(&config)?);
                Ok(())
            }
            HintsCommand::Purge => {
                messaging::purge_queue(&config)?;
                Ok(())
            }
        },
        Command::Gc { aggressive } => {
            let git = GitOps::new(&config);
            maintenance::gc_repositories(&config, &git, aggressive)?;
            Ok(())
        }
    }
}
