//! Daemon entry point.
//!
//! Started plain it becomes the master (reaper); the master re-execs
//! this same binary with `--slave` for the control plane, so a SIGHUP
//! upgrade replaces slave code without touching running containers.

use std::fs::OpenOptions;
use std::process::exit;

use clap::Parser;
use env_logger::Target;

use alice_warden::config::WardenConfig;
use alice_warden::daemon::run_slave;
use alice_warden::reaper::run_master;

#[derive(Parser)]
#[command(name = "wardend", version, about = "hierarchical container runtime daemon")]
struct Args {
    /// Run the inner control-plane process (spawned by the master).
    #[arg(long)]
    slave: bool,

    /// Log to stderr instead of the configured log file.
    #[arg(long)]
    foreground: bool,
}

fn init_logging(config: &WardenConfig, foreground: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if !foreground {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
        {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open {}: {}, logging to stderr", config.log_file.display(), e),
        }
    }
    builder.init();
}

fn main() {
    let args = Args::parse();
    let config = WardenConfig::from_env();
    init_logging(&config, args.foreground);

    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("wardend: need root privileges to start");
        exit(1);
    }

    let code = if args.slave {
        run_slave(config)
    } else {
        run_master(&config)
    };
    exit(code);
}
