mod abi_state;
mod cli;
mod config;
mod control_socket;
mod daemon_mgr;
mod injector;
mod maps;
mod monitor;
mod status;
mod tracee;
mod trace_cmd;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use cli::{Cli, Command, CtlAction};

fn init_logging() {
    if std::env::var_os("KSU").is_some() {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(if cfg!(debug_assertions) {
                    LevelFilter::Trace
                } else {
                    LevelFilter::Info
                })
                .with_tag("zygisk-ptrace"),
        );
    } else {
        env_logger::init();
    }
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse_args();

    match &cli.command {
        Command::Version => {
            println!("Zygisk Ptrace Tracer {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Monitor => {
            config::init(&cli)?;
            if config::instance().daemonize {
                daemonize_supervisor()?;
            }
            monitor::run()?;
        }
        Command::Trace { pid, restart } => {
            config::init(&cli)?;
            if !trace_cmd::run(*pid, *restart) {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(*pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
                std::process::exit(1);
            }
        }
        Command::Ctl { action } => {
            config::init(&cli)?;
            let cmd = match action {
                CtlAction::Start => zp_common::control::ControlCommand::Start,
                CtlAction::Stop => zp_common::control::ControlCommand::Stop,
                CtlAction::Exit => zp_common::control::ControlCommand::Exit,
            };
            control_socket::send_control_command(cmd)?;
        }
    }

    Ok(())
}

fn daemonize_supervisor() -> Result<()> {
    let magic_path = &config::instance().magic_path;
    daemonize::Daemonize::new()
        .working_directory(magic_path)
        .start()
        .map_err(|e| anyhow::anyhow!("failed to daemonize: {e}"))
}
