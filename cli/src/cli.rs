use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Exchange messages and file descriptors with a child process")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a child and run the hello / hellohello / quitquitquit exchange
    Echo(EchoArgs),

    /// Pass an open file to a child, which prints its contents
    SendFile(SendFileArgs),

    /// Child side of the other commands
    #[command(hide = true)]
    Child(ChildArgs),
}

#[derive(Args)]
pub struct EchoArgs {
    /// Number of hello rounds before quitting
    #[arg(long, default_value_t = 1)]
    pub rounds: u32,

    /// Seconds to wait for the child to connect
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Args)]
pub struct SendFileArgs {
    /// File to open and pass to the child
    pub path: PathBuf,

    /// Seconds to wait for the child to connect
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Args)]
pub struct ChildArgs {
    /// What the child does with its pipe
    #[arg(value_enum)]
    pub mode: ChildMode,

    /// Token naming the pipe to claim
    #[arg(long, env = "TETHER_PIPE_TOKEN")]
    pub token: String,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildMode {
    /// Double every message until told to quit
    Echo,
    /// Print the file attached to the first message
    ReadFile,
}

impl ChildMode {
    pub fn as_arg(self) -> &'static str {
        match self {
            ChildMode::Echo => "echo",
            ChildMode::ReadFile => "read-file",
        }
    }
}
