#![allow(clippy::result_large_err)]

use anyhow::Context;
use questlink::app::NetworkAccess;
use questlink::config::NetworkConfig;
use questlink::queue::OperationStatus;
use questlink::telemetry;
use questlink::transport::{Anonymous, AuthProvider, StaticToken};
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "config/local";
const TOKEN_ENV: &str = "QUESTLINK_TOKEN";

enum CliCommand {
    Run { config_path: Option<String> },
    Probe { config_path: Option<String> },
    Drain { config_path: Option<String> },
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args(std::env::args().skip(1))? {
        CliCommand::Run { config_path } => {
            let access = build(config_path)?;
            access.run().await.context("network access runtime error")
        }
        CliCommand::Probe { config_path } => {
            let access = build(config_path)?;
            let reachable = access.monitor().check_reachability().await;
            let snapshot = access.monitor().snapshot();
            println!(
                "{} reachable={reachable} device_online={} healthy={}",
                snapshot.selected_endpoint, snapshot.device_online, snapshot.healthy
            );
            let aggregate = access.aggregator().aggregate();
            println!("{}", serde_json::to_string(&aggregate.totals)?);
            for metrics in &aggregate.endpoints {
                println!("{}", serde_json::to_string(metrics)?);
            }
            Ok(())
        }
        CliCommand::Drain { config_path } => {
            let access = build(config_path)?;
            if access.queue().is_empty() {
                println!("no pending operations");
                return Ok(());
            }
            access.monitor().check_reachability().await;
            for result in access.drain_queue().await {
                let outcome = match &result.status {
                    OperationStatus::Completed { .. } => "completed".to_string(),
                    OperationStatus::Rejected { reason } => format!("rejected: {reason}"),
                    OperationStatus::Retained { reason } => format!("retained: {reason}"),
                    OperationStatus::Abandoned { error } => format!("abandoned: {error}"),
                };
                println!(
                    "#{} {} {} -> {outcome}",
                    result.operation.id,
                    result.operation.http_method,
                    result.operation.endpoint_path
                );
            }
            println!("{} operation(s) still pending", access.queue().len());
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn build(config_path: Option<String>) -> anyhow::Result<NetworkAccess> {
    let path = config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = NetworkConfig::load_from(&path).context("failed to load configuration")?;

    let auth: Arc<dyn AuthProvider> = match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => Arc::new(StaticToken(token)),
        _ => Arc::new(Anonymous),
    };

    NetworkAccess::initialise(config, auth).context("failed to construct network access layer")
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().peekable();
    let command = match args.peek().map(String::as_str) {
        Some("run" | "probe" | "drain" | "help") => args.next(),
        _ => None,
    };

    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if config_path.is_some() {
                    anyhow::bail!("config path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after {arg}"))?;
                config_path = Some(value);
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(match command.as_deref() {
        None | Some("run") => CliCommand::Run { config_path },
        Some("probe") => CliCommand::Probe { config_path },
        Some("drain") => CliCommand::Drain { config_path },
        _ => CliCommand::Help,
    })
}

fn print_help() {
    println!(
        "\
Usage: questlink [run|probe|drain|help] [OPTIONS]

Commands:
  run                    Monitor connectivity and hold the realtime channel until Ctrl+C
  probe                  Check the selected endpoint once and print health metrics
  drain                  Replay operations queued while offline

Options:
  -c, --config <PATH>    Config file without extension (default: config/local)
  -h, --help             Print this help message

Environment:
  QUESTLINK_TOKEN        Bearer token for requests and the realtime channel
  QUESTLINK__*           Overrides for config keys, e.g. QUESTLINK__PRIMARY_ENDPOINT
"
    );
}
