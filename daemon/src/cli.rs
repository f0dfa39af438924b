use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dsfleet_protocol::management::instance::InstanceId;

use crate::config::CONFIG_ENV;

#[derive(Parser, Debug)]
#[command(name = "dsfleet", version, about = "Dedicated server fleet manager")]
pub struct Cli {
    /// Host config file
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Deployment tag passed to the hosting plugin, overrides the config
    #[arg(long, global = true, env = "ENVIRONMENT", value_parser = ["dev", "test", "prod"])]
    pub environment: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List all existing servers with their state and source archive
    List,

    /// Create a new server from a world archive
    Create {
        number: InstanceId,
        world: PathBuf,
        /// Appended to the world name to form the server name
        #[arg(short, long, default_value = "")]
        suffix: String,
    },

    /// Move a stopped server into the archive
    Archive {
        number: InstanceId,
        /// Keep every file, not just logs and the instance folder
        #[arg(short, long)]
        full: bool,
    },

    /// Kill and delete a server
    Destroy { number: InstanceId },

    /// Start a server in the background
    Start {
        number: InstanceId,
        /// Let the server update itself before starting
        #[arg(short, long)]
        update: bool,
    },

    /// Ask a server to shut down
    Stop { number: InstanceId },

    /// Kill a server
    Kill { number: InstanceId },

    /// Print the process id of a server
    Pid { number: InstanceId },

    /// Exit with 0 if the server is starting or serving
    Check { number: InstanceId },

    /// Print the state of a server
    Status { number: InstanceId },

    /// Keep a server running, restarting or recreating it on failure
    Keepalive {
        number: InstanceId,
        /// Only stop the running keepalive
        #[arg(short, long)]
        stop: bool,
        /// Seconds between checks
        #[arg(short, long, default_value_t = 10)]
        period: u64,
    },

    /// Archive and recreate a server from its original world archive, then start it
    Recreate { number: InstanceId },

    /// Kill and start a server
    Restart { number: InstanceId },

    /// Update server files of a stopped server from the template
    Upgrade { number: InstanceId },
}

impl Command {
    pub fn number(&self) -> Option<InstanceId> {
        match self {
            Command::List => None,
            Command::Create { number, .. }
            | Command::Archive { number, .. }
            | Command::Destroy { number }
            | Command::Start { number, .. }
            | Command::Stop { number }
            | Command::Kill { number }
            | Command::Pid { number }
            | Command::Check { number }
            | Command::Status { number }
            | Command::Keepalive { number, .. }
            | Command::Recreate { number }
            | Command::Restart { number }
            | Command::Upgrade { number } => Some(*number),
        }
    }

    /// Commands that run under the instance lock.
    pub fn is_locked(&self) -> bool {
        !matches!(self, Command::List | Command::Keepalive { .. })
    }
}
