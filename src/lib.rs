//! Anchorage: the artefact governance engine
//!
//! **Anchorage decides what a mutation may do to a governed artefact and
//! how that artefact's text is produced.**
//!
//! Every project moves through four markers, INTENT, ROUTE, EXECUTE and
//! COMPLETE. Each marker holds at most one canonical artefact (its
//! *anchor*), and every change to an anchor goes through a Review
//! Conference that either commits a new version or rejects the request and
//! leaves the prior version authoritative.
//!
//! # Core Principles
//!
//! - **Linear lifecycle**: a marker opens only after the previous one is anchored and stable
//! - **Append-only execution**: stage identity is fixed; decisions, evidence and history only grow
//! - **Contracts as code**: each conference runs under a tagged rule set, and rejections name the rule
//! - **Canonical text**: one deterministic, ASCII-only rendering per artefact
//! - **Optimistic concurrency**: every write names the version it read
//!
//! # Architecture
//!
//! ## Artefacts
//!
//! - `CKO` anchors INTENT, a `WKO` route plan anchors ROUTE
//! - The `EXECUTION_STATE` ledger anchors EXECUTE
//! - A `PKO` or `TKO` anchors COMPLETE
//!
//! ## Storage
//!
//! [`core::registry::AnchorStore`] is the storage boundary. The in-memory
//! store suits embedding; the SQLite store routes every operation through
//! `DbBroker`, which serializes access and appends to `broker.events.jsonl`.
//!
//! # Examples
//!
//! ```bash
//! # Create a store in the current project
//! anchorage init
//!
//! # Submit a mutation request
//! anchorage submit --input request.json
//!
//! # Show the canonical INTENT anchor
//! anchorage anchor show --project 7 --marker INTENT
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: knowledge objects, formatter, ledger, markers, contracts, conferences, storage

pub mod core;
mod cli;

use cli::{AnchorCommand, Cli, Command, ContractArg, LifecycleCommand, OutputFormat};
use crate::core::{
    artefact::ArtefactKind,
    conference::{self, Engine, MutationRequest},
    config::{self, GovernanceConfig},
    contract::Contract,
    db::SqliteAnchorStore,
    error::GovernanceError,
    formatter,
    knowledge::{FieldMap, KnowledgeObject},
    marker::Marker,
    output,
    registry::{AnchorKey, AnchorStore},
    route::{RoutePlan, RouteStage},
    store::{self, Store},
    time,
};

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct FormatInput {
    #[serde(default)]
    fields: FieldMap,
    #[serde(default)]
    stages: Option<Vec<RouteStage>>,
}

fn read_input(path: &Path) -> Result<String, GovernanceError> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(GovernanceError::IoError)?;
        Ok(buf)
    } else {
        fs::read_to_string(path).map_err(GovernanceError::IoError)
    }
}

fn resolve_store(explicit: Option<&Path>) -> Result<Store, GovernanceError> {
    if let Some(root) = explicit {
        return Ok(Store::at(root));
    }
    let current_dir = std::env::current_dir()?;
    store::find_store(&current_dir).ok_or_else(|| {
        GovernanceError::NotFound(format!(
            "no {} store above {}; run `anchorage init` first",
            store::STORE_DIR,
            current_dir.display()
        ))
    })
}

fn open_engine(store: &Store) -> Result<Engine<SqliteAnchorStore>, GovernanceError> {
    let config = config::load_config(&store.root)?;
    let registry = SqliteAnchorStore::open(&store.root)?;
    Ok(Engine::new(registry, config).with_audit_log(store.conference_log_path()))
}

fn default_contract(marker: Marker) -> Contract {
    match marker {
        Marker::Execute => Contract::ExecuteReview,
        _ => Contract::General,
    }
}

pub fn run() -> Result<(), GovernanceError> {
    let cli = Cli::parse();
    let explicit_store = cli.store.as_deref();

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
        }
        Command::Init { dir, force } => run_init(explicit_store, &dir, force)?,
        Command::Format {
            kind,
            project,
            input,
        } => {
            let config = match resolve_store(explicit_store) {
                Ok(store) => config::load_config(&store.root)?,
                Err(_) => GovernanceConfig::default(),
            };
            let kind: ArtefactKind = kind.parse()?;
            let knowledge_kind = kind.knowledge_kind().ok_or_else(|| {
                GovernanceError::ValidationError(format!("{} is not a knowledge object kind", kind))
            })?;
            let parsed: FormatInput = serde_json::from_str(&read_input(&input)?)?;
            let (object, warnings) =
                KnowledgeObject::from_fields(knowledge_kind, project, parsed.fields, config.summary_word_limit)?;
            let opts = config.format_options();
            let text = match parsed.stages {
                Some(stages) => formatter::render_route_plan(&RoutePlan::new(object, stages)?, &opts)?,
                None => formatter::render_knowledge(&object, &opts)?,
            };
            print!("{}", text);
            print_warnings(warnings.iter().map(|w| format!("{}: {}", w.section, w.message)));
        }
        Command::Normalise { input } => {
            let config = match resolve_store(explicit_store) {
                Ok(store) => config::load_config(&store.root)?,
                Err(_) => GovernanceConfig::default(),
            };
            let text = read_input(&input)?;
            print!("{}", formatter::format_document(&text, &config.format_options())?);
        }
        Command::Submit { input, format } => {
            let store = resolve_store(explicit_store)?;
            let request: MutationRequest = serde_json::from_str(&read_input(&input)?)?;
            let mut engine = open_engine(&store)?;
            run_submit(&mut engine, request, format)?;
        }
        Command::Anchor { command } => {
            let store = resolve_store(explicit_store)?;
            let registry = SqliteAnchorStore::open(&store.root)?;
            run_anchor(&registry, command)?;
        }
        Command::Lifecycle {
            command: LifecycleCommand::Show { project, chat },
        } => {
            let store = resolve_store(explicit_store)?;
            let registry = SqliteAnchorStore::open(&store.root)?;
            match registry.load_lifecycle(project, &chat)? {
                Some(lifecycle) => println!("{}", serde_json::to_string_pretty(&lifecycle)?),
                None => {
                    return Err(GovernanceError::NotFound(format!(
                        "no lifecycle for project {} chat '{}'",
                        project, chat
                    )));
                }
            }
        }
        Command::Brief {
            project,
            marker,
            contract,
        } => {
            let store = resolve_store(explicit_store)?;
            let registry = SqliteAnchorStore::open(&store.root)?;
            let marker: Marker = marker.parse()?;
            let contract = match contract {
                Some(ContractArg::General) => Contract::General,
                Some(ContractArg::StageReview) => Contract::StageReview,
                Some(ContractArg::ExecuteReview) => Contract::ExecuteReview,
                Some(ContractArg::Regeneration) => Contract::Regeneration,
                None => default_contract(marker),
            };
            let anchor = registry.load(AnchorKey::new(project, marker))?;
            print!("{}", conference::conference_brief(contract, marker, anchor.as_ref()));
        }
    }

    Ok(())
}

fn run_init(explicit: Option<&Path>, dir: &Path, force: bool) -> Result<(), GovernanceError> {
    use colored::Colorize;

    let store = match explicit {
        Some(root) => Store::at(root),
        None => Store::for_project_dir(dir),
    };
    fs::create_dir_all(&store.root).map_err(GovernanceError::IoError)?;

    let config_path = store.config_path();
    if force || !config_path.exists() {
        fs::write(&config_path, GovernanceConfig::default().to_toml()?).map_err(GovernanceError::IoError)?;
    }
    let db_path = crate::core::db::initialize_anchor_db(&store.root)?;

    println!(
        "{} store ready at {}",
        "✓".bright_green(),
        store.root.display().to_string().bright_white()
    );
    println!("  {} {}", "config".bright_cyan(), config_path.display());
    println!("  {} {}", "anchors".bright_cyan(), db_path.display());
    Ok(())
}

fn run_submit<S: AnchorStore>(
    engine: &mut Engine<S>,
    request: MutationRequest,
    format: OutputFormat,
) -> Result<(), GovernanceError> {
    use colored::Colorize;

    match engine.submit(request) {
        Ok(committed) => {
            match format {
                OutputFormat::Json => {
                    let envelope = time::command_envelope(
                        "submit",
                        "committed",
                        serde_json::to_value(&committed)?,
                    );
                    println!("{}", serde_json::to_string_pretty(&envelope)?);
                }
                OutputFormat::Text => {
                    eprintln!(
                        "{} {} v{} ({}, {})",
                        "committed".bright_green().bold(),
                        committed.anchor.identifier,
                        committed.anchor.version,
                        committed.anchor.status,
                        committed.contract
                    );
                    if let Some(exe) = &committed.regenerated {
                        eprintln!(
                            "  {} {} v{}",
                            "regenerated".bright_cyan(),
                            exe.identifier,
                            exe.version
                        );
                    }
                    print!("{}", committed.document);
                }
            }
            print_warnings(
                committed
                    .warnings
                    .iter()
                    .map(|w| format!("{}: {}", w.section, w.message)),
            );
            Ok(())
        }
        Err(rejected) => {
            if format == OutputFormat::Json {
                let mut envelope = time::error_envelope("submit", &rejected.error);
                if let Some(obj) = envelope.as_object_mut() {
                    obj.insert("conference_id".to_string(), rejected.conference_id.clone().into());
                    obj.insert(
                        "prior_version".to_string(),
                        rejected.prior.as_ref().map(|a| a.version).into(),
                    );
                }
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else if rejected.error.requires_route_revision() {
                eprintln!(
                    "  {} {}",
                    "▸".bright_cyan(),
                    "this change needs a ROUTE revision first".bright_white()
                );
            }
            Err(rejected.error)
        }
    }
}

fn run_anchor(registry: &SqliteAnchorStore, command: AnchorCommand) -> Result<(), GovernanceError> {
    match command {
        AnchorCommand::Show {
            project,
            marker,
            format,
        } => {
            let key = AnchorKey::new(project, marker.parse()?);
            let anchor = registry
                .load(key)?
                .ok_or_else(|| GovernanceError::NotFound(format!("no anchor for {}", key)))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&anchor)?),
                OutputFormat::Text => print!("{}", anchor.document),
            }
        }
        AnchorCommand::History {
            project,
            marker,
            format,
        } => {
            let key = AnchorKey::new(project, marker.parse()?);
            let versions = registry.history(key)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&versions)?),
                OutputFormat::Text => {
                    for anchor in &versions {
                        let note = anchor
                            .deviations
                            .last()
                            .filter(|d| d.revision == anchor.revision && anchor.revision > 0)
                            .map(|d| format!(" deviation: {}", output::compact_line(&d.reason, 60)))
                            .unwrap_or_default();
                        println!(
                            "v{} r{} {} {} by {}{}",
                            anchor.version,
                            anchor.revision,
                            anchor.status,
                            anchor.updated_at,
                            anchor.updated_by,
                            note
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_warnings(warnings: impl Iterator<Item = String>) {
    use colored::Colorize;

    for warning in warnings {
        eprintln!("{} {}", "warning:".bright_yellow().bold(), warning);
    }
}
