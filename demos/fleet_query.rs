use std::env;
use std::fs;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use lgwire::fleet::{self, Host};

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example fleet_query -- <hosts.json> (--shell | --lgw) [--channels 1,2] [--timeout 3] <command>..."
    );
}

enum Mode {
    Shell,
    Lgw,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(hosts_path) = args.first() else {
        print_usage();
        process::exit(2);
    };

    let mut mode = None;
    let mut channels = vec![1u32];
    let mut timeout = Duration::from_secs(3);
    let mut commands = Vec::new();
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--shell" => mode = Some(Mode::Shell),
            "--lgw" => mode = Some(Mode::Lgw),
            "--channels" => {
                let list = rest.next().context("--channels needs a value")?;
                channels = list
                    .split(',')
                    .map(|ch| ch.trim().parse::<u32>())
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("invalid channel list '{list}'"))?;
            }
            "--timeout" => {
                let secs = rest.next().context("--timeout needs a value")?;
                let secs: f64 = secs
                    .parse()
                    .with_context(|| format!("invalid timeout '{secs}'"))?;
                timeout = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("timeout out of range '{secs}'"))?;
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            command => commands.push(command.to_string()),
        }
    }
    let Some(mode) = mode else {
        print_usage();
        process::exit(2);
    };

    let content = fs::read_to_string(hosts_path)
        .with_context(|| format!("failed to read hosts file '{hosts_path}'"))?;
    let hosts: Vec<Host> = serde_json::from_str(&content)
        .with_context(|| format!("'{hosts_path}' is not a host list"))?;

    let results = match mode {
        Mode::Shell => fleet::send_shell_commands(&hosts, &commands, timeout).await,
        Mode::Lgw => fleet::send_lgw_commands(&hosts, &commands, &channels, timeout).await,
    };

    println!("{}", serde_json::to_string_pretty(&results)?);
    let failed = fleet::failed_hosts(&results);
    if !failed.is_empty() {
        eprintln!("failed_hosts: {failed:?}");
        process::exit(1);
    }
    Ok(())
}
