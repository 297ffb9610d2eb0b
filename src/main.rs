//! Orbit headless host.
//!
//! Reads queries from stdin, one per line, and prints results as they
//! arrive. Lines starting with `:` are commands:
//!
//! ```text
//! :states          show every extension's connection state
//! :reload <id>     restart an extension (also re-enables a disabled one)
//! :stop <id>       stop an extension
//! :rescan          pick up added, removed and changed extension directories
//! :quit            shut down
//! ```

use std::sync::Arc;

use orbit::core::DispatchEvent;
use orbit::{logging, Config, DispatchStream, ExtensionHost, HostHandle, LogNotifier, OrbitResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return;
    }

    let config = Config::load();
    logging::init(&config.logging);

    if let Err(e) = run(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_help() {
    println!("orbit - extension host for keyboard launchers");
    println!();
    println!("Reads queries from stdin and prints results.");
    println!("Config: {}", Config::config_path().display());
    println!();
    println!("Commands: :states, :reload <id>, :stop <id>, :rescan, :quit");
}

async fn run(config: Config) -> OrbitResult<()> {
    let host = ExtensionHost::load(&config, Arc::new(LogNotifier)).await?;
    tracing::info!(address = %host.endpoint().address(), "Orbit ready");

    let (interrupt_tx, mut interrupt) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        tracing::warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = interrupt.recv() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&host, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    host.shutdown().await
}

/// Returns `false` when the user asked to quit.
async fn handle_line(host: &HostHandle, line: &str) -> OrbitResult<bool> {
    let Some(command) = line.strip_prefix(':') else {
        let stream = host.dispatch_query(line).await?;
        tokio::spawn(print_results(stream));
        return Ok(true);
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    match name {
        "quit" | "q" => return Ok(false),
        "states" => {
            for (id, state) in host.states().await? {
                println!("{:<24} {:?}", id, state);
            }
        }
        "reload" if !arg.is_empty() => report(host.reload(arg).await),
        "stop" if !arg.is_empty() => report(host.stop_extension(arg).await),
        "rescan" => match host.rescan().await {
            Ok(changes) => println!(
                "added: [{}] removed: [{}] updated: [{}]",
                changes.added.join(", "),
                changes.removed.join(", "),
                changes.updated.join(", ")
            ),
            Err(e) => eprintln!("Error: {}", e),
        },
        _ => eprintln!("Unknown command: {}", line),
    }
    Ok(true)
}

fn report(result: OrbitResult<()>) {
    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }
}

async fn print_results(mut stream: DispatchStream) {
    let id = stream.correlation_id().clone();
    while let Some(event) = stream.next().await {
        match event {
            DispatchEvent::Batch { provider, items } => {
                for item in items {
                    match &item.description {
                        Some(description) => {
                            println!("[{}] {}: {} ({})", id, provider, item.title, description)
                        }
                        None => println!("[{}] {}: {}", id, provider, item.title),
                    }
                }
            }
            DispatchEvent::Complete { items, timed_out } => {
                if timed_out.is_empty() {
                    println!("[{}] done, {} results", id, items.len());
                } else {
                    let names: Vec<String> = timed_out.iter().map(ToString::to_string).collect();
                    println!(
                        "[{}] done, {} results (timed out: {})",
                        id,
                        items.len(),
                        names.join(", ")
                    );
                }
            }
            DispatchEvent::Superseded => println!("[{}] superseded", id),
        }
    }
}
