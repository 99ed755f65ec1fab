//! redb-mapping CLI - address, cardinality and mapping store tooling.

use clap::{Parser, Subcommand};
use redb_mapping::core::{
    infer_cardinality, validate_cardinality, validate_transformation_cardinality, AddressScope,
    ResourceAddress,
};
use redb_mapping::store::{attached_rules, require_mapping};
use redb_mapping::{Config, MappingError, MappingStore, PgMappingStore, Scope};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "redb-mapping")]
#[command(about = "Resource addresses, rule cardinality and mapping store administration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a resource address and print its parts
    Resolve {
        /// Address in any supported form (redb://, mcp://, stream://, db://, database.table)
        address: String,
    },

    /// Build a canonical address from a scope and its parts
    BuildAddress {
        /// Address scope: database, table or column
        #[arg(long, default_value = "table")]
        scope: String,

        #[arg(long)]
        database: String,

        #[arg(long)]
        table: Option<String>,

        #[arg(long)]
        column: Option<String>,
    },

    /// Infer the cardinality of a rule from its item counts
    Infer {
        /// Number of source items
        sources: usize,

        /// Number of target items
        targets: usize,
    },

    /// Check a cardinality against item counts and a transformation type
    CheckRule {
        /// Claimed cardinality, e.g. one-to-many
        #[arg(long)]
        cardinality: String,

        /// Number of source items
        #[arg(long)]
        sources: usize,

        /// Number of target items
        #[arg(long)]
        targets: usize,

        /// Transformation type, e.g. passthrough, merge, sink
        #[arg(long, default_value = "passthrough")]
        transformation_type: String,
    },

    /// Load and validate the configuration file
    CheckConfig,

    /// Create the mapping store tables
    InitStore,

    /// List the mappings of a workspace
    ListMappings {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        workspace: String,
    },

    /// Show a mapping with its ordered rules and filters
    ShowMapping {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        workspace: String,

        /// Mapping id
        mapping: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MappingError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MappingError::Config)?;

    // Offline commands don't need a configuration file
    match &cli.command {
        Commands::Resolve { address } => return resolve(address, cli.output_json),
        Commands::BuildAddress {
            scope,
            database,
            table,
            column,
        } => {
            let address = ResourceAddress::for_scope(
                scope.parse::<AddressScope>()?,
                database,
                table.as_deref(),
                column.as_deref(),
            )?;
            if cli.output_json {
                println!(
                    "{}",
                    json!({
                        "canonical": address.to_string(),
                        "object_type": address.object_type().as_str(),
                    })
                );
            } else {
                println!("{}", address);
            }
            return Ok(());
        }
        Commands::Infer { sources, targets } => {
            let label = infer_cardinality(*sources, *targets);
            if cli.output_json {
                println!("{}", json!({ "cardinality": label }));
            } else {
                println!("{}", label);
            }
            return Ok(());
        }
        Commands::CheckRule {
            cardinality,
            sources,
            targets,
            transformation_type,
        } => {
            let cardinality = validate_cardinality(cardinality, *sources, *targets)?;
            validate_transformation_cardinality(transformation_type, cardinality)?;
            println!(
                "{} with {} source and {} target items is valid for {}",
                cardinality, sources, targets, transformation_type
            );
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::CheckConfig => {
            if cli.output_json {
                println!(
                    "{}",
                    json!({
                        "store": format!("{}:{}/{}", config.store.host, config.store.port, config.store.database),
                        "schema": config.store.schema,
                        "batch_size": config.copy.batch_size,
                        "parallel_workers": config.copy.get_parallel_workers(),
                        "broadcast": config.broadcast.enabled,
                        "transformations": config.transformations.len(),
                    })
                );
            } else {
                println!("Configuration is valid");
                println!(
                    "  Store: {}:{}/{} (schema {})",
                    config.store.host, config.store.port, config.store.database, config.store.schema
                );
                println!(
                    "  Copy: batch size {}, {} workers",
                    config.copy.batch_size,
                    config.copy.get_parallel_workers()
                );
                println!(
                    "  Broadcast: {}",
                    if config.broadcast.enabled { "enabled" } else { "single node" }
                );
                println!("  Static transformations: {}", config.transformations.len());
            }
        }
        Commands::InitStore => {
            let store = PgMappingStore::connect(&config.store).await?;
            store.init_schema().await?;
            println!("Mapping store schema '{}' is ready", config.store.schema);
        }
        Commands::ListMappings { tenant, workspace } => {
            let store = PgMappingStore::connect(&config.store).await?;
            let scope = Scope::new(tenant, workspace);
            if !store.workspace_exists(&scope).await? {
                return Err(MappingError::not_found("workspace", scope.to_string()));
            }
            let mappings = store.list_mappings(&scope).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else {
                println!("{} mappings in {}", mappings.len(), scope);
                for m in &mappings {
                    println!(
                        "  {} {} ({}, {} rules, {})",
                        m.id,
                        m.name,
                        m.mapping_type(),
                        m.rule_count,
                        if m.is_validated() { "validated" } else { "not validated" }
                    );
                }
            }
        }
        Commands::ShowMapping {
            tenant,
            workspace,
            mapping,
        } => {
            let store = PgMappingStore::connect(&config.store).await?;
            let scope = Scope::new(tenant, workspace);
            let mapping = require_mapping(&store, &scope, &mapping).await?;
            let rules = attached_rules(&store, &scope, &mapping.id).await?;
            let filters = store.list_filters(&mapping.id).await?;

            if cli.output_json {
                let rules: Vec<_> = rules
                    .iter()
                    .map(|r| json!({ "order": r.order, "rule": r.rule }))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "mapping": mapping,
                        "rules": rules,
                        "filters": filters,
                    }))?
                );
            } else {
                println!("{} ({})", mapping.name, mapping.mapping_type());
                println!("  Source: {}", mapping.source);
                println!("  Target: {}", mapping.target);
                for r in &rules {
                    println!(
                        "  [{}] {} {} via {}",
                        r.order, r.rule.name, r.rule.cardinality, r.rule.transformation
                    );
                }
                for f in &filters {
                    println!(
                        "  filter {} {} {}",
                        f.operator.as_str(),
                        f.filter_type.as_str(),
                        serde_json::Value::Object(f.expression.clone())
                    );
                }
                for e in &mapping.validation.errors {
                    println!("  error: {}", e);
                }
                for w in &mapping.validation.warnings {
                    println!("  warning: {}", w);
                }
            }
        }
        Commands::Resolve { .. }
        | Commands::BuildAddress { .. }
        | Commands::Infer { .. }
        | Commands::CheckRule { .. } => {
            unreachable!() // Handled above
        }
    }

    Ok(())
}

fn resolve(address: &str, output_json: bool) -> Result<(), MappingError> {
    let parsed = ResourceAddress::parse_with_protocol(address)?;
    let a = &parsed.address;
    if output_json {
        println!(
            "{}",
            json!({
                "canonical": a.to_string(),
                "protocol": format!("{:?}", parsed.protocol),
                "object_type": a.object_type().as_str(),
                "database_id": a.database_id(),
                "table": a.table_name(),
                "column": a.column_name(),
            })
        );
    } else {
        println!("{}", a);
        println!("  Protocol: {:?}", parsed.protocol);
        println!("  Object: {} {}", a.object_type().as_str(), a.object_name());
        if let Some(db) = a.database_id() {
            println!("  Database: {}", db);
        }
        if let Some(table) = a.table_name() {
            println!("  Table: {}", table);
        }
        if let Some(column) = a.column_name() {
            println!("  Column: {}", column);
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" | "info" | "warn" | "error" => verbosity.to_lowercase(),
        other => return Err(format!("unknown verbosity '{}'", other)),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
