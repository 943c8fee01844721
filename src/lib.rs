//! Charter: governed instances assembled from pluggable capability modules.
//!
//! An **instance** is one organizational unit with its own storage and a single
//! logical address. Internally it routes every call, by operation tag, to the
//! module that implements it.
//!
//! # Architecture
//!
//! ## Dispatch Kernel
//!
//! `core::kernel` builds the operation-tag → module map once, runs each module's
//! init against the instance's storage, and afterwards routes calls. The module
//! executes against the instance's storage and sees the original caller. A
//! module may ask the instance for another module's answer (`ExecContext::query`);
//! the lookup goes through the same operation map, in-process.
//!
//! ## Partitioned Storage
//!
//! All modules of an instance share one SQLite database. Each module type owns
//! a namespace whose SHA-256 names its partition; modules only ever receive a
//! handle scoped to their own partition.
//!
//! ## The Broker
//!
//! Every external call runs through `DbBroker`:
//! - Serialization (in-process lock, one total order of calls)
//! - All-or-nothing commit (one SQLite transaction per call)
//! - Audit logging (`broker.events.jsonl`)
//!
//! ## Modules (Plugins)
//!
//! - `membership`: roles and the join-request workflow; the role oracle
//! - `claims`: claims voted to a quorum by members
//!
//! # Examples
//!
//! ```bash
//! charter create --name guild --creator alice \
//!     --module membership --init '{"admin":"alice"}' \
//!     --module claims --init '{"quorum":2}'
//! charter call <instance> request_to_join --caller bob
//! charter call <instance> accept_request --caller alice \
//!     --payload '{"requester":"bob","role":"member"}'
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: kernel, partition scheme, broker, registry, store and errors
//! - [`plugins`]: capability modules and the built-in module catalog

pub mod core;
pub mod plugins;

use crate::core::{
    address::Address,
    broker::DbBroker,
    config, error,
    registry::{CreateInstance, InstanceFilter, InstanceRecord, Registry, Visibility},
    store::{self, Store},
    time,
};
use crate::plugins::catalog;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "charter",
    version = env!("CARGO_PKG_VERSION"),
    about = "Governed instances assembled from pluggable modules"
)]
struct Cli {
    /// Store root (defaults to $CHARTER_ROOT, then ./.charter).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct CreateCli {
    /// Display name of the instance.
    #[clap(long)]
    name: String,
    #[clap(long, default_value = "")]
    description: String,
    /// 'public' or 'private' (defaults to the configured visibility).
    #[clap(long)]
    visibility: Option<String>,
    /// Grouping label recorded with the instance.
    #[clap(long, default_value = "")]
    label: String,
    /// Identity creating (and initializing) the instance.
    #[clap(long)]
    creator: String,
    /// Module id; repeat once per module, in registration order.
    #[clap(long = "module", required = true)]
    modules: Vec<String>,
    /// JSON init payload; repeat once per module, same order as --module.
    #[clap(long = "init")]
    inits: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct InstancesCli {
    #[clap(subcommand)]
    command: InstancesCommand,
}

#[derive(Subcommand, Debug)]
enum InstancesCommand {
    /// List instances, optionally filtered
    List {
        #[clap(long)]
        visibility: Option<String>,
        #[clap(long)]
        creator: Option<String>,
        #[clap(long)]
        label: Option<String>,
    },
    /// Number of registered instances
    Count,
    /// Show one instance by id or zero-based index
    Show { instance: String },
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List built-in modules, their partitions and operation tags
    #[clap(name = "modules", visible_alias = "m")]
    Modules,

    /// Create and initialize a new instance
    #[clap(name = "create")]
    Create(CreateCli),

    /// Call an operation (by name or 0x tag) on an instance
    #[clap(name = "call", visible_alias = "c")]
    Call {
        instance: String,
        operation: String,
        #[clap(long)]
        caller: String,
        /// JSON payload for the operation.
        #[clap(long, default_value = "null")]
        payload: String,
    },

    /// Show an instance's operation map
    #[clap(name = "ops")]
    Ops { instance: String },

    /// Registry queries
    #[clap(name = "instances", visible_alias = "i")]
    Instances(InstancesCli),

    /// Show the broker audit trail
    #[clap(name = "audit")]
    Audit,

    /// Show version information
    #[clap(name = "version")]
    Version,
}

fn parse_json(raw: &str, what: &str) -> Result<Value, error::CharterError> {
    serde_json::from_str(raw).map_err(|e| {
        error::CharterError::ValidationError(error::Reason::MalformedPayload(format!(
            "{}: {}",
            what, e
        )))
    })
}

fn emit(envelope: Value) -> Result<(), error::CharterError> {
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn resolve_record(registry: &Registry<'_>, key: &str) -> Result<InstanceRecord, error::CharterError> {
    match key.parse::<u64>() {
        Ok(index) => registry.by_index(index),
        Err(_) => registry.get(key),
    }
}

pub fn run() -> Result<(), error::CharterError> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let store = Store::open(store::resolve_root(cli.root.as_deref()))?;
    let config = config::load_config(&store.root)?;
    let modules = catalog::builtin_catalog();
    let registry = Registry::open(&store)?;

    match cli.command {
        Command::Version => {}
        Command::Modules => {
            emit(time::command_envelope(
                "modules",
                None,
                "ok",
                json!({ "modules": catalog::describe(&modules) }),
            ))?;
        }
        Command::Create(args) => {
            let init_payloads = args
                .inits
                .iter()
                .map(|raw| parse_json(raw, "--init"))
                .collect::<Result<Vec<_>, _>>()?;
            let visibility = args
                .visibility
                .as_deref()
                .map(str::parse::<Visibility>)
                .transpose()?;
            let request = CreateInstance {
                name: args.name,
                description: args.description,
                visibility,
                label: args.label,
                creator: Address::new(args.creator)?,
                modules: args.modules,
                init_payloads,
            };
            let (record, instance) = registry.create_instance(&modules, &config, request)?;
            emit(time::command_envelope(
                "create",
                Some(&record.id),
                "ok",
                json!({ "instance": record, "operations": instance.operations() }),
            ))?;
        }
        Command::Call {
            instance,
            operation,
            caller,
            payload,
        } => {
            let caller = Address::new(caller)?;
            let payload = parse_json(&payload, "--payload")?;
            let instance = registry.open_instance(&instance, &modules)?;
            let receipt = instance.call(&operation, &payload, &caller)?;
            emit(time::command_envelope(
                "call",
                Some(instance.id()),
                "ok",
                json!({ "receipt": receipt }),
            ))?;
        }
        Command::Ops { instance } => {
            let instance = registry.open_instance(&instance, &modules)?;
            emit(time::command_envelope(
                "ops",
                Some(instance.id()),
                "ok",
                json!({
                    "initialized": instance.is_initialized(),
                    "operations": instance.operations(),
                }),
            ))?;
        }
        Command::Instances(cli) => match cli.command {
            InstancesCommand::List {
                visibility,
                creator,
                label,
            } => {
                let filter = InstanceFilter {
                    visibility: visibility
                        .as_deref()
                        .map(str::parse::<Visibility>)
                        .transpose()?,
                    creator: creator.map(Address::new).transpose()?,
                    label,
                };
                let records = registry.list(&filter)?;
                emit(time::command_envelope(
                    "instances.list",
                    None,
                    "ok",
                    json!({ "count": records.len(), "instances": records }),
                ))?;
            }
            InstancesCommand::Count => {
                emit(time::command_envelope(
                    "instances.count",
                    None,
                    "ok",
                    json!({ "count": registry.count()? }),
                ))?;
            }
            InstancesCommand::Show { instance } => {
                let record = resolve_record(&registry, &instance)?;
                emit(time::command_envelope(
                    "instances.show",
                    Some(&record.id),
                    "ok",
                    json!({ "instance": record }),
                ))?;
            }
        },
        Command::Audit => {
            let broker = DbBroker::new(&store.audit_log_path());
            for entry in broker.read_audit_log()? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }
    Ok(())
}
