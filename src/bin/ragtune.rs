#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ragtune::config::{build_controller, load_config};
use ragtune::core::{ControllerError, CostBudget, JsonlTraceSink, RunOptions, TraceEvent};
use ragtune::registry;

#[derive(Parser)]
#[command(name = "ragtune", version, about = "Budget-aware retrieval-reranking pipeline")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter pipeline config
    Init {
        #[arg(default_value = "ragtune.json")]
        path: PathBuf,
    },
    /// Build a JSONL corpus from a directory of .txt files
    Index {
        input: PathBuf,
        #[arg(long, default_value = "corpus.jsonl")]
        out: PathBuf,
    },
    /// Load a config and construct the pipeline without running it
    Validate { config: PathBuf },
    /// Run one query through the pipeline
    Run {
        #[arg(long)]
        config: PathBuf,
        query: String,
        /// Override a budget limit (RESOURCE=LIMIT, repeatable)
        #[arg(long = "limit", value_name = "RESOURCE=LIMIT")]
        limits: Vec<String>,
        /// Mirror the trace to a JSONL file
        #[arg(long)]
        trace_out: Option<PathBuf>,
        /// Print full document contents instead of snippets
        #[arg(long)]
        full: bool,
        /// Drive the pipeline through the async controller entry point
        #[arg(long = "async")]
        use_async: bool,
    },
    /// List registered component types
    List,
    /// Render a trace JSONL file as a timeline
    Visualize {
        trace: PathBuf,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Init { path } => init_config(&path),
        Commands::Index { input, out } => index_corpus(&input, &out),
        Commands::Validate { config } => {
            let file = load_config(&config)?;
            build_controller(&file.pipeline)?;
            println!("ok: pipeline '{}' is valid", file.pipeline.name);
            Ok(())
        }
        Commands::Run {
            config,
            query,
            limits,
            trace_out,
            full,
            use_async,
        } => run_query(&config, &query, &limits, trace_out.as_deref(), full, use_async),
        Commands::List => {
            let registry = registry::global().read().expect("registry lock");
            for (category, types) in registry.list() {
                println!("{category}: {}", types.join(", "));
            }
            Ok(())
        }
        Commands::Visualize { trace, limit } => visualize(&trace, limit),
    }
}

fn init_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()).into());
    }
    let starter = serde_json::json!({
        "pipeline": {
            "name": "quickstart",
            "budget": {
                "limits": {
                    "tokens": 4000,
                    "rerank_docs": 50,
                    "rerank_calls": 10,
                    "reformulations": 1,
                    "latency_ms": 2000
                }
            },
            "components": {
                "retriever": {"type": "memory", "params": {"path": "corpus.jsonl"}},
                "reranker": {"type": "keyword"},
                "estimator": {"type": "baseline"},
                "scheduler": {"type": "topk", "params": {"batch_size": 5}},
                "assembler": {"type": "greedy"}
            },
            "retrieval": {
                "original_query_depth": 10,
                "num_reformulations": 0,
                "depth_per_reformulation": 5
            }
        }
    });
    std::fs::write(path, serde_json::to_string_pretty(&starter)? + "\n")?;
    println!("wrote {}", path.display());
    Ok(())
}

fn index_corpus(input: &Path, out: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut documents: Vec<(String, String)> = Vec::new();
    if input.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        paths.sort();
        for path in paths {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "doc".to_string());
            documents.push((id, std::fs::read_to_string(&path)?));
        }
    } else {
        let id = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "doc".to_string());
        documents.push((id, std::fs::read_to_string(input)?));
    }
    if documents.is_empty() {
        return Err("no .txt files found to index".into());
    }

    let mut file = std::fs::File::create(out)?;
    for (id, content) in &documents {
        let line = serde_json::json!({"id": id, "content": content.trim(), "score": 0.0});
        writeln!(file, "{line}")?;
    }
    println!("indexed {} documents into {}", documents.len(), out.display());
    Ok(())
}

fn parse_limit_overrides(limits: &[String]) -> Result<Vec<(String, f64)>, String> {
    limits
        .iter()
        .map(|raw| {
            let (resource, value) = raw
                .split_once('=')
                .ok_or_else(|| format!("bad --limit '{raw}', expected RESOURCE=LIMIT"))?;
            let value: f64 = value
                .parse()
                .map_err(|_| format!("bad --limit value in '{raw}'"))?;
            Ok((resource.to_string(), value))
        })
        .collect()
}

fn run_query(
    config_path: &Path,
    query: &str,
    limits: &[String],
    trace_out: Option<&Path>,
    full: bool,
    use_async: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = load_config(config_path)?;
    let mut controller = build_controller(&file.pipeline)?;

    let mut budget = CostBudget {
        limits: file.pipeline.budget.limits.clone(),
    };
    for (resource, value) in parse_limit_overrides(limits)? {
        budget = budget.with_limit(resource, value);
    }

    let sink = trace_out.map(JsonlTraceSink::create).transpose()?;

    let options = RunOptions {
        budget: Some(budget),
        cancel: None,
        sink: sink.as_ref().map(|s| s as &dyn ragtune::core::TraceSink),
    };
    let result = if use_async {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(controller.run_with_options_async(query, options))
    } else {
        controller.run_with_options(query, options)
    };
    if let Some(sink) = sink {
        let mirrored = sink.finish()?;
        tracing::debug!(events = mirrored, "trace mirror flushed");
    }

    let output = match result {
        Ok(output) => output,
        Err(ControllerError::FatalRetrieval { source, trace }) => {
            eprintln!("fatal: original retrieval failed: {source}");
            eprintln!("trace: {} events recorded before failure", trace.events.len());
            return Err(source.into());
        }
        Err(err) => return Err(err.into()),
    };

    println!("pipeline: {}", file.pipeline.name);
    println!("query:    {}", output.query);
    println!();
    for (rank, doc) in output.documents.iter().enumerate() {
        let content = if full {
            doc.content.clone()
        } else {
            snippet(&doc.content, 80)
        };
        println!("{:>3}. {:>7.4}  {}  {}", rank + 1, doc.score, doc.id, content);
    }
    println!();
    println!("budget used:");
    for (resource, used) in &output.final_budget_state {
        println!("  {resource:<16} {used:.1}");
    }
    if let Some(exit) = output
        .trace
        .events
        .iter()
        .rev()
        .find(|e| e.action == "loop_exit")
    {
        println!("loop exit: {}", serde_json::to_string(&exit.details)?);
    }
    println!("trace: {} events", output.trace.events.len());
    Ok(())
}

fn snippet(content: &str, max_chars: usize) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

fn visualize(path: &Path, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let events: Vec<TraceEvent> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    let Some(first) = events.first() else {
        println!("empty trace");
        return Ok(());
    };
    let start = first.timestamp;
    for event in events.iter().take(limit) {
        let offset_ms = (event.timestamp - start).num_milliseconds();
        let details = serde_json::to_string(&event.details)?;
        println!(
            "[+{offset_ms:>6}ms] {:<12} {:<18} {}",
            event.component,
            event.action,
            snippet(&details, 100)
        );
    }
    if events.len() > limit {
        println!("… {} more events", events.len() - limit);
    }
    Ok(())
}
