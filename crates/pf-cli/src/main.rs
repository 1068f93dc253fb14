mod cypher;
mod logging;
mod passes;
mod transcript;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pf_core::graph_contracts::InsightNote;
use pf_export::config::{ExportConfig, SequencerBackend};
use pf_export::qa_csv::CsvInput;
use pf_export::{init_layout, ExportError, ExportFailure, SessionExporter, ToolResponse};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "pf")]
#[command(about = "Session-scoped export of therapy transcript artifacts", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct GlobalArgs {
    #[arg(long, global = true)]
    export_root: Option<PathBuf>,
    #[arg(long, global = true)]
    mirror_root: Option<PathBuf>,
    #[arg(long, global = true)]
    schema_path: Option<PathBuf>,
    /// sqlite or counter-file
    #[arg(long, global = true)]
    sequencer: Option<String>,
    #[arg(long = "patient_id", alias = "patient-id", global = true)]
    patient_id: Option<String>,
    #[arg(long = "session_type", alias = "session-type", global = true)]
    session_type: Option<String>,
    #[arg(long = "session_date", alias = "session-date", global = true)]
    session_date: Option<String>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the export roots, install the graph schema and bootstrap the database
    Init,
    /// Allocate the next chunk id for the session
    NextChunk,
    /// Write a QA CSV chunk from CSV text or JSON records
    WriteCsv {
        #[arg(long)]
        chunk_id: Option<u64>,
        #[arg(long, conflicts_with = "records")]
        csv: Option<PathBuf>,
        #[arg(long)]
        records: Option<PathBuf>,
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },
    /// Validate and write a Graph-JSON chunk
    WriteGraph {
        #[arg(long)]
        chunk_id: Option<u64>,
        #[arg(long)]
        graph: PathBuf,
    },
    /// Write a Cypher chunk
    WriteCypher {
        #[arg(long)]
        chunk_id: Option<u64>,
        #[arg(long)]
        cypher: PathBuf,
    },
    /// Write an insight note (Markdown plus JSON sidecar)
    WriteNote {
        #[arg(long)]
        title: Option<String>,
        #[arg(long, conflicts_with = "notes_file")]
        notes: Option<String>,
        #[arg(long)]
        notes_file: Option<PathBuf>,
        /// JSON object stored in the sidecar
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Upsert QA rows from a JSON array of records
    Upsert {
        #[arg(long)]
        records: PathBuf,
    },
    /// Run a read-only SQL statement against the session database
    Query {
        sql: String,
        /// JSON array of positional parameters
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run one deterministic pass
    Pass {
        #[arg(value_enum, ignore_case = true)]
        pass: PassName,
        #[arg(long = "input_path", alias = "input-path")]
        input_path: Option<PathBuf>,
        #[arg(long = "chunk_size", alias = "chunk-size", default_value_t = passes::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long = "print_facts", alias = "print-facts", default_value_t = false)]
        print_facts: bool,
    },
    /// Run passes A, B and C in order
    Pipeline {
        #[arg(long = "input_path", alias = "input-path")]
        input_path: PathBuf,
        #[arg(long = "chunk_size", alias = "chunk-size", default_value_t = passes::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long = "print_facts", alias = "print-facts", default_value_t = false)]
        print_facts: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PassName {
    A,
    B,
    C,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = export_config(&cli.global)?;
    logging::init(
        cli.global.debug,
        cli.global.log_dir.as_deref(),
        config.session_key().ok().as_ref(),
    );
    debug!(event = "config_loaded", export_root = %config.export_root.display(), sequencer = config.sequencer.as_str());

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Commands::Pass {
            pass,
            input_path,
            chunk_size,
            print_facts,
        } => {
            run_pass(config, pass, input_path.as_deref(), chunk_size, print_facts, &mut out)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pipeline {
            input_path,
            chunk_size,
            print_facts,
        } => {
            let mut exporter = open_exporter(config)?;
            let facts = passes::pipeline(&mut exporter, &input_path, chunk_size, &mut out)?;
            if print_facts {
                passes::print_facts(&facts, &mut out)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let response = run_tool(config, command)?;
            writeln!(out, "{}", response.to_json_string())?;
            Ok(if response.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Environment first, then explicit flags.
fn export_config(args: &GlobalArgs) -> Result<ExportConfig> {
    let mut config = ExportConfig::from_env().context("Invalid PF_* environment")?;
    if let Some(root) = &args.export_root {
        config.export_root = root.clone();
    }
    if let Some(root) = &args.mirror_root {
        config.mirror_root = Some(root.clone());
    }
    if let Some(path) = &args.schema_path {
        config.schema_path = path.clone();
    }
    if let Some(raw) = &args.sequencer {
        config.sequencer = match SequencerBackend::parse(raw) {
            Some(backend) => backend,
            None => bail!("unknown sequencer '{raw}' (expected sqlite or counter-file)"),
        };
    }
    if let Some(value) = &args.patient_id {
        config.patient_id = Some(value.clone());
    }
    if let Some(value) = &args.session_type {
        config.session_type = Some(value.clone());
    }
    if let Some(value) = &args.session_date {
        config.session_date = Some(value.clone());
    }
    Ok(config)
}

fn open_exporter(config: ExportConfig) -> Result<SessionExporter> {
    SessionExporter::new(config).map_err(|failure| anyhow::Error::new(failure.error))
}

fn run_pass(
    config: ExportConfig,
    pass: PassName,
    input_path: Option<&Path>,
    chunk_size: usize,
    print_facts: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let input = || input_path.context("--input_path is required for passes A and B");
    match pass {
        PassName::A => {
            passes::pass_a(input()?, chunk_size, out)?;
        }
        PassName::B => {
            let chunks = passes::pass_a(input()?, chunk_size, out)?;
            let mut exporter = open_exporter(config)?;
            let facts = passes::pass_b(&mut exporter, &chunks, out)?;
            if print_facts {
                passes::print_facts(&facts, out)?;
            }
        }
        PassName::C => {
            let mut exporter = open_exporter(config)?;
            passes::pass_c(&mut exporter, out)?;
        }
    }
    Ok(())
}

/// Runs a tool subcommand. Export failures become a failed `ToolResponse`;
/// only unreadable inputs surface as errors.
fn run_tool(config: ExportConfig, command: Commands) -> Result<ToolResponse> {
    if let Commands::Init = command {
        let report = init_layout(&config).map_err(ExportFailure::from);
        return Ok(ToolResponse::from_result(report));
    }

    let mut exporter = match SessionExporter::new(config) {
        Ok(exporter) => exporter,
        Err(failure) => return Ok(ToolResponse::failure(&failure)),
    };
    info!(event = "tool_invoked", session = %exporter.session_key());

    let response = match command {
        Commands::NextChunk => {
            ToolResponse::from_result(exporter.next_chunk().map(|chunk_id| json!({ "chunk_id": chunk_id })))
        }
        Commands::WriteCsv {
            chunk_id,
            csv,
            records,
            columns,
        } => {
            let csv_text = csv.as_deref().map(read_input).transpose()?;
            let records = records.as_deref().map(read_records).transpose()?;
            match CsvInput::from_parts(csv_text, records, columns) {
                Ok(input) => ToolResponse::from_result(exporter.write_csv(chunk_id, input)),
                Err(err) => ToolResponse::failure(&ExportError::from(err).into()),
            }
        }
        Commands::WriteGraph { chunk_id, graph } => {
            let text = read_input(&graph)?;
            let document: Value = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse graph JSON {}", graph.display()))?;
            ToolResponse::from_result(exporter.write_graph(chunk_id, document))
        }
        Commands::WriteCypher { chunk_id, cypher } => {
            let text = read_input(&cypher)?;
            ToolResponse::from_result(exporter.write_cypher(chunk_id, &text))
        }
        Commands::WriteNote {
            title,
            notes,
            notes_file,
            metadata,
        } => {
            let notes = match (notes, notes_file) {
                (Some(notes), _) => notes,
                (None, Some(path)) => read_input(&path)?,
                (None, None) => String::new(),
            };
            let mut note = InsightNote::new(title.unwrap_or_default(), notes);
            if let Some(raw) = metadata {
                let metadata: Value =
                    serde_json::from_str(&raw).context("Failed to parse --metadata JSON")?;
                note = note.with_metadata(metadata);
            }
            ToolResponse::from_result(exporter.write_note(&note))
        }
        Commands::Upsert { records } => {
            let records = read_records(&records)?;
            ToolResponse::from_result(exporter.upsert_qa_rows(&records))
        }
        Commands::Query { sql, params, limit } => {
            let params: Vec<Value> = match params {
                Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON array")?,
                None => Vec::new(),
            };
            ToolResponse::from_result(exporter.query(&sql, &params, limit))
        }
        Commands::Init | Commands::Pass { .. } | Commands::Pipeline { .. } => {
            bail!("not a tool subcommand")
        }
    };
    Ok(response)
}

/// Reads a file, or stdin when the path is `-`.
fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let text = read_input(path)?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))
}
