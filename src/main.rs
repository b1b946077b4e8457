#![allow(clippy::result_large_err)]

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::config::definitions::DefinitionsConfig;
use switchyard::config::EngineConfig;
use switchyard::domain::Message;
use switchyard::endpoint::EndpointDescriptor;
use switchyard::engine::Engine;
use switchyard::gateway::{DeliveryError, EndpointDeliverer};
use switchyard::telemetry;
use tracing::info;

enum CliCommand {
    Run {
        definitions_path: Option<String>,
    },
    Validate {
        configs: Vec<String>,
    },
    Help,
    ValidateHelp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args()? {
        CliCommand::Run { definitions_path } => {
            let mut config = EngineConfig::load().context("failed to load configuration")?;
            if let Some(path) = definitions_path {
                config.definitions_path = Some(path);
            }
            run(config).await
        }
        CliCommand::Validate { configs } => {
            run_validate_command(configs)?;
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::ValidateHelp => {
            print_validate_help();
            Ok(())
        }
    }
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::new(&config, Arc::new(TracingDeliverer));

    if let Some(path) = &config.definitions_path {
        let definitions = DefinitionsConfig::from_path(path)
            .with_context(|| format!("failed to load definitions from {path}"))?;
        engine
            .load_definitions(definitions)
            .context("failed to register definitions")?;
    }

    info!(
        service = "switchyard",
        component = "main",
        "engine started, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    engine.shutdown();
    info!(service = "switchyard", component = "main", "engine stopped");
    Ok(())
}

/// Stand-in transport for local runs: every delivery is logged and accepted.
struct TracingDeliverer;

#[async_trait]
impl EndpointDeliverer for TracingDeliverer {
    async fn deliver(
        &self,
        endpoint: &EndpointDescriptor,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        info!(
            service = "switchyard",
            component = "deliverer",
            endpoint = %endpoint.name,
            address = %endpoint.address,
            source = %message.source,
            "delivered"
        );
        Ok(())
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliCommand::Run {
            definitions_path: None,
        });
    };

    if first == "validate" {
        return parse_validate_args(args);
    }

    let mut definitions_path = None;
    let mut pending = Some(first);

    loop {
        let arg = match pending.take() {
            Some(value) => value,
            None => match args.next() {
                Some(value) => value,
                None => break,
            },
        };

        match arg.as_str() {
            "-c" | "--config" => {
                if definitions_path.is_some() {
                    anyhow::bail!("definitions path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after {arg}"))?;
                definitions_path = Some(value);
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { definitions_path })
}

fn parse_validate_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut configs = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliCommand::ValidateHelp),
            other => configs.push(other.to_string()),
        }
    }

    if configs.is_empty() {
        anyhow::bail!("switchyard validate requires at least one definitions path");
    }

    Ok(CliCommand::Validate { configs })
}

fn run_validate_command(configs: Vec<String>) -> anyhow::Result<()> {
    let mut had_error = false;

    for config in configs {
        let path = PathBuf::from(&config);
        match DefinitionsConfig::from_path(&path) {
            Ok(definitions) => println!(
                "validated {} ({} endpoints, {} transformations, {} routes, {} flows)",
                path.display(),
                definitions.endpoints.len(),
                definitions.transformations.len(),
                definitions.routes.len(),
                definitions.flows.len(),
            ),
            Err(err) => {
                eprintln!("{err}");
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow::anyhow!("one or more definition files failed validation"))
    } else {
        Ok(())
    }
}

fn print_help() {
    println!(
        "\
Usage: switchyard [OPTIONS]
       switchyard validate <DEFINITIONS>...

Options:
  -c, --config <PATH>    Path to switchyard definitions YAML file
  -h, --help             Print this help message
"
    );
}

fn print_validate_help() {
    println!(
        "\
Usage: switchyard validate <DEFINITIONS>...

Options:
  -h, --help             Print this help message
"
    );
}
