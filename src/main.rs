use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use inframedic::config::Config;
use inframedic::model::provision::ProvisionRequest;

#[derive(Parser)]
#[command(
    name = "inframedic",
    about = "Autonomous incident response and provisioning for cloud fleets",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "inframedic.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + coordinator loop)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run one monitor scan and print any new incidents
    Scan {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent incidents
    Incidents {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Provision infrastructure from a description or template
    Provision {
        /// Natural-language description of what to create
        description: String,

        #[arg(long, default_value = "nyc3")]
        region: String,

        #[arg(long, default_value = "development")]
        environment: String,

        /// Maximum monthly cost in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Use a built-in template instead of generation
        #[arg(long)]
        template: Option<String>,

        /// Template parameter, key=value (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(Some(&cli.config))?;

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "starting inframedic daemon");
            inframedic::serve(&bind, config).await?;
        }
        Commands::Scan { json } => {
            let coordinator = inframedic::build_coordinator(&config)?;
            let incidents = coordinator.detect_now().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&incidents)?);
            } else if incidents.is_empty() {
                println!("No new incidents.");
            } else {
                println!("{:<38} | {:<10} | {:<12} | Description", "Incident", "Severity", "Metric");
                println!("{:-<38}-|-{:-<10}-|-{:-<12}-|-{:-<40}", "", "", "", "");
                for incident in &incidents {
                    println!(
                        "{:<38} | {:<10} | {:<12} | {}",
                        incident.id,
                        incident.severity.as_str(),
                        incident.metric.as_str(),
                        incident.description
                    );
                }
            }
        }
        Commands::Incidents { limit } => {
            let coordinator = inframedic::build_coordinator(&config)?;
            let incidents = coordinator.store().list_incidents(limit)?;
            if incidents.is_empty() {
                println!("No incidents recorded.");
            } else {
                println!("{:<38} | {:<10} | {:<12} | Detected", "Incident", "Status", "Severity");
                println!("{:-<38}-|-{:-<10}-|-{:-<12}-|-{:-<25}", "", "", "", "");
                for incident in &incidents {
                    println!(
                        "{:<38} | {:<10} | {:<12} | {}",
                        incident.id,
                        incident.status.as_str(),
                        incident.severity.as_str(),
                        incident.detected_at.to_rfc3339()
                    );
                }
            }
        }
        Commands::Provision {
            description,
            region,
            environment,
            budget,
            template,
            params,
        } => {
            let mut template_params = BTreeMap::new();
            for pair in params {
                match pair.split_once('=') {
                    Some((k, v)) => {
                        template_params
                            .insert(k.to_string(), serde_json::Value::String(v.to_string()));
                    }
                    None => anyhow::bail!("invalid --param '{pair}', expected key=value"),
                }
            }

            let request = ProvisionRequest {
                id: uuid::Uuid::new_v4(),
                requester: "cli".to_string(),
                description,
                region,
                environment,
                budget_limit: budget,
                template_id: template,
                template_params,
                created_at: chrono::Utc::now(),
            };

            let coordinator = inframedic::build_coordinator(&config)?;
            let result = coordinator.provision(&request).await;

            println!("\n=== Provisioning Result ===");
            println!("Request:  {}", result.request_id);
            println!("Success:  {}", result.success);
            if let Some(cost) = result.cost_estimate {
                println!("Cost:     ${cost:.2}/month");
            }
            for resource in &result.resources_created {
                println!(" - {} ({}) id={}", resource.name, resource.kind.as_str(), resource.id);
            }
            if let Some(error) = &result.error {
                println!("Error:    {error}");
            }
            println!("===========================\n");

            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
