use clap::{Parser, Subcommand};

/// Zygisk Ptrace Tracer.
#[derive(Parser, Debug)]
#[command(name = "zygisk-ptrace", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Run the supervisor in the foreground instead of daemonizing on `monitor`.
    #[arg(long, global = true)]
    pub no_daemonize: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start supervising init for fresh spawner execs.
    Monitor,
    /// Attach to a stopped, seized tracee and inject the agent into it.
    Trace {
        pid: i32,
        /// Broadcast `ZygoteRestart` to the daemon before tracing.
        #[arg(long)]
        restart: bool,
    },
    /// Send a command to a running supervisor's control socket.
    Ctl {
        #[command(subcommand)]
        action: CtlAction,
    },
    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CtlAction {
    Start,
    Stop,
    Exit,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
