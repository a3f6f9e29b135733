use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use yard_inventory_api::{AddShipmentRequest, AddVesselRequest, InventoryApi, API_CONTRACT_VERSION};
use yard_inventory_core::{ShipmentId, VesselId, DEFAULT_VERIFY_SAMPLE_SIZE};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "yard")]
#[command(about = "Yard inventory operator CLI")]
struct Cli {
    #[arg(long, env = "YARD_DB", default_value = "./yard_inventory.sqlite3")]
    db: PathBuf,

    /// Tracing filter; logs go to stderr so stdout stays JSON.
    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    log_level: String,

    #[arg(long, env = "YARD_VERIFY_SAMPLE_SIZE", default_value_t = DEFAULT_VERIFY_SAMPLE_SIZE)]
    verify_sample_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Shipment {
        #[command(subcommand)]
        command: Box<ShipmentCommand>,
    },
    Vessel {
        #[command(subcommand)]
        command: Box<VesselCommand>,
    },
    Migration {
        #[command(subcommand)]
        command: Box<MigrationCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbPathArgs),
    Restore(DbPathArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbPathArgs {
    #[arg(long = "file")]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ShipmentCommand {
    Add(ShipmentAddArgs),
    List,
    Show(ShipmentShowArgs),
}

#[derive(Debug, Args)]
struct ShipmentAddArgs {
    #[arg(long)]
    vessel_name: Option<String>,
    #[arg(long)]
    job_number: Option<String>,
    #[arg(long)]
    pod: Option<String>,
    #[arg(long)]
    vessel_id: Option<String>,
}

#[derive(Debug, Args)]
struct ShipmentShowArgs {
    #[arg(long)]
    shipment_id: String,
}

#[derive(Debug, Subcommand)]
enum VesselCommand {
    Add(VesselAddArgs),
    List,
}

#[derive(Debug, Args)]
struct VesselAddArgs {
    #[arg(long)]
    vessel_name: String,
    #[arg(long)]
    job_number: Option<String>,
    #[arg(long)]
    pod: Option<String>,
    #[arg(long)]
    shipping_line: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MigrationCommand {
    Analyze,
    Execute(ExecuteArgs),
    Verify(VerifyArgs),
    Rollback(ConfirmArgs),
    Cleanup(CleanupArgs),
    Runs,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    sample_size: Option<u32>,
}

#[derive(Debug, Args)]
struct ConfirmArgs {
    #[arg(long)]
    confirm: bool,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[arg(long)]
    confirm: bool,
    /// Strip legacy fields even while shipments remain unmigrated.
    #[arg(long)]
    skip_verify: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "data": other,
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let api = InventoryApi::new(cli.db).with_verify_sample_size(cli.verify_sample_size);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Shipment { command } => run_shipment(*command, &api),
        Command::Vessel { command } => run_vessel(*command, &api),
        Command::Migration { command } => run_migration(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &InventoryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.file)?;
            emit_json(serde_json::json!({ "backup_path": args.file, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.file)?;
            emit_json(serde_json::json!({ "restored_from": args.file, "status": "ok" }))
        }
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_shipment(command: ShipmentCommand, api: &InventoryApi) -> Result<()> {
    match command {
        ShipmentCommand::Add(args) => {
            let vessel_id = args.vessel_id.as_deref().map(VesselId::parse).transpose()?;
            let shipment = api.add_shipment(AddShipmentRequest {
                vessel_name: args.vessel_name,
                job_number: args.job_number,
                pod: args.pod,
                vessel_id,
            })?;
            emit_json(serde_json::to_value(shipment)?)
        }
        ShipmentCommand::List => {
            emit_json(serde_json::json!({ "shipments": api.list_shipments()? }))
        }
        ShipmentCommand::Show(args) => {
            let shipment = api.get_shipment(ShipmentId::parse(&args.shipment_id)?)?;
            emit_json(serde_json::to_value(shipment)?)
        }
    }
}

fn run_vessel(command: VesselCommand, api: &InventoryApi) -> Result<()> {
    match command {
        VesselCommand::Add(args) => {
            let vessel = api.add_vessel(AddVesselRequest {
                vessel_name: args.vessel_name,
                job_number: args.job_number,
                pod: args.pod,
                etd: None,
                shipping_line: args.shipping_line,
            })?;
            emit_json(serde_json::to_value(vessel)?)
        }
        VesselCommand::List => emit_json(serde_json::json!({ "vessels": api.list_vessels()? })),
    }
}

fn run_migration(command: MigrationCommand, api: &InventoryApi) -> Result<()> {
    match command {
        MigrationCommand::Analyze => emit_json(serde_json::to_value(api.analyze()?)?),
        MigrationCommand::Execute(args) => {
            emit_json(serde_json::to_value(api.execute(args.dry_run)?)?)
        }
        MigrationCommand::Verify(args) => {
            emit_json(serde_json::to_value(api.verify(args.sample_size)?)?)
        }
        MigrationCommand::Rollback(args) => {
            emit_json(serde_json::to_value(api.rollback(args.confirm)?)?)
        }
        MigrationCommand::Cleanup(args) => {
            emit_json(serde_json::to_value(api.cleanup(args.confirm, !args.skip_verify)?)?)
        }
        MigrationCommand::Runs => emit_json(serde_json::json!({ "runs": api.list_runs()? })),
    }
}
