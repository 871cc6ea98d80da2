use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[clap(name = "listenlog", version, about = "Keeps a deduplicated log of what you listen to on Spotify")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// `run` when no subcommand is given.
    #[must_use]
    pub fn subcommand(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll Spotify and keep the listen log up to date until Ctrl+C
    Run,
    /// Sign in to Spotify in the browser and cache the token
    Auth,
    /// Run one job immediately and print its status as JSON
    Trigger {
        #[clap(value_enum)]
        job: TriggerJob,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerJob {
    /// One live poll cycle
    Poll,
    /// Reconcile the recently played history
    Backfill,
    /// Fetch metadata for artists that have none yet
    SyncArtists,
}
