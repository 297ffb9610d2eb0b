//! Demo weather extension for orbit.
//!
//! Answers `<trigger> <city>` with a (made up) temperature. Launched by the
//! host with the connection details in the environment.
//!
//! Flags change its behaviour, which the integration tests rely on:
//! - `--silent` never answers queries
//! - `--fail` answers every query with an error
//! - `--garbage` sends an invalid line right after connecting
//! - `--bare` answers with hand-written lines that omit `extensionId`
//! - `--announce <trigger>` re-registers with a different trigger

use orbit::config::LoggingConfig;
use orbit::core::Query;
use orbit::ipc::{ExtensionClient, ExtensionResultItem, HostMessage, LogLevel};
use orbit::{logging, OrbitResult, ResultAction};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Normal,
    Silent,
    Fail,
    Garbage,
    Bare,
}

struct Options {
    mode: Mode,
    announce: Option<String>,
}

impl Options {
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mode = if args.iter().any(|a| a == "--silent") {
            Mode::Silent
        } else if args.iter().any(|a| a == "--fail") {
            Mode::Fail
        } else if args.iter().any(|a| a == "--garbage") {
            Mode::Garbage
        } else if args.iter().any(|a| a == "--bare") {
            Mode::Bare
        } else {
            Mode::Normal
        };
        let announce = args
            .iter()
            .position(|a| a == "--announce")
            .and_then(|i| args.get(i + 1))
            .cloned();
        Self { mode, announce }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init(&LoggingConfig::default());

    if let Err(e) = run(Options::from_args()).await {
        tracing::error!("Demo extension failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(options: Options) -> OrbitResult<()> {
    let mut client = ExtensionClient::from_env().await?;
    client
        .log(LogLevel::Info, "weather extension ready")
        .await?;

    if let Some(trigger) = &options.announce {
        client
            .register_manifest(Some("Weather"), &[trigger.clone()])
            .await?;
    }
    if options.mode == Mode::Garbage {
        client.send_raw("this is not json\n").await?;
    }

    while let Some(message) = client.recv().await? {
        match message {
            HostMessage::Query {
                correlation_id,
                query,
            } => match options.mode {
                Mode::Silent => {}
                Mode::Fail => {
                    client
                        .error(Some(&correlation_id), "weather service unavailable")
                        .await?
                }
                Mode::Bare => {
                    let line = json!({
                        "type": "QueryResult",
                        "correlationId": correlation_id,
                        "payload": forecast(&query),
                    });
                    client.send_raw(&format!("{}\n", line)).await?
                }
                Mode::Normal | Mode::Garbage => {
                    client.respond(&correlation_id, &forecast(&query)).await?
                }
            },
            HostMessage::Shutdown => break,
        }
    }
    Ok(())
}

fn forecast(text: &str) -> Vec<ExtensionResultItem> {
    let query = Query::new(text);
    let Some(city) = query.argument() else {
        return vec![ExtensionResultItem {
            description: Some("Type a city name".to_string()),
            action: ResultAction::SetQuery {
                query: format!("{} ", query.keyword()),
            },
            ..ExtensionResultItem::new("Weather")
        }];
    };

    let mut chars = city.trim().chars();
    let city = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };

    vec![ExtensionResultItem {
        action: ResultAction::Copy {
            text: format!("{}: 14°C", city),
        },
        ..ExtensionResultItem::new(format!("{}: 14°C", city))
    }]
}
