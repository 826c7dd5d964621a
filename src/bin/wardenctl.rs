//! Command-line client, one subcommand per RPC request.

use std::process::exit;

use clap::{Parser, Subcommand};

use alice_warden::client::WardenClient;
use alice_warden::config::WardenConfig;
use alice_warden::error::Error;

#[derive(Parser)]
#[command(name = "wardenctl", version, about = "control the warden daemon")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a stopped container.
    Create { name: String },
    /// Destroy a container and its subtree.
    Destroy { name: String },
    /// Start a container.
    Start { name: String },
    /// Stop a container and its subtree.
    Stop { name: String },
    /// Freeze a running container.
    Pause { name: String },
    /// Thaw a paused container.
    Resume { name: String },
    /// Send a signal to the main task.
    Kill { name: String, signal: i32 },
    /// List containers.
    List {
        /// Glob filter, `*` matches any run of characters.
        filter: Option<String>,
    },
    /// List properties with descriptions.
    Plist,
    /// List data with descriptions.
    Dlist,
    /// Read a property or data value.
    Get { name: String, variable: String },
    /// Set a property.
    Set {
        name: String,
        property: String,
        value: String,
    },
    /// Block until one of the named containers dies.
    Wait {
        names: Vec<String>,
        /// Timeout in milliseconds; 0 polls, negative waits forever.
        #[arg(short, long, default_value_t = -1)]
        timeout: i64,
    },
    /// Print daemon and client versions.
    Version,
}

fn run(client: &mut WardenClient, command: Cmd) -> Result<(), Error> {
    match command {
        Cmd::Create { name } => client.create(&name),
        Cmd::Destroy { name } => client.destroy(&name),
        Cmd::Start { name } => client.start(&name),
        Cmd::Stop { name } => client.stop(&name),
        Cmd::Pause { name } => client.pause(&name),
        Cmd::Resume { name } => client.resume(&name),
        Cmd::Kill { name, signal } => client.kill(&name, signal),
        Cmd::List { filter } => {
            for name in client.list(filter.as_deref())? {
                println!("{}", name);
            }
            Ok(())
        }
        Cmd::Plist => {
            for (name, desc) in client.property_list()? {
                println!("{:24} {}", name, desc);
            }
            Ok(())
        }
        Cmd::Dlist => {
            for (name, desc) in client.data_list()? {
                println!("{:24} {}", name, desc);
            }
            Ok(())
        }
        Cmd::Get { name, variable } => {
            // Properties and data share one read namespace here.
            let batch = client.get(&[name.as_str()], &[variable.as_str()])?;
            for entry in batch {
                for value in entry.values {
                    match value.value {
                        Some(v) => println!("{}", v),
                        None => {
                            eprintln!(
                                "{}: {}",
                                value.variable,
                                value.error_message.unwrap_or_default()
                            );
                            exit(1);
                        }
                    }
                }
            }
            Ok(())
        }
        Cmd::Set {
            name,
            property,
            value,
        } => client.set_property(&name, &property, &value),
        Cmd::Wait { names, timeout } => {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            match client.wait(&refs, timeout)? {
                Some(name) => println!("{}", name),
                None => println!("timeout"),
            }
            Ok(())
        }
        Cmd::Version => {
            println!("client {}", env!("CARGO_PKG_VERSION"));
            println!("daemon {}", client.version()?);
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();
    let config = WardenConfig::from_env();

    let mut client = match WardenClient::connect(&config.socket_path) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("wardenctl: {}", e);
            exit(1);
        }
    };

    if let Err(e) = run(&mut client, args.command) {
        eprintln!("wardenctl: {}", e);
        exit(1);
    }
}
