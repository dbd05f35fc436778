//! dagrun CLI entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dagrun::core::GraphSpec;
use dagrun::{Actor, EchoExecutor, Engine, EngineConfig, Graph, SqliteStore, Submission};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dagrun", version, about = "Run DAG workflows of agent and human steps")]
struct Cli {
    /// SQLite database holding task state
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Engine configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Actor recorded on submissions, input and cancellations
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a graph file without running it
    Validate { graph: PathBuf },
    /// Submit a graph and run it until it finishes or waits for input
    Run {
        graph: PathBuf,
        /// Workflow id recorded on the task; defaults to the file stem
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Show task and node status
    Status { task_id: String },
    /// Show the result log
    Results { task_id: String },
    /// Supply input to a waiting human step and continue the task
    Resume {
        task_id: String,
        node_id: String,
        input: String,
    },
    /// Cancel a task
    Cancel { task_id: String },
    /// Continue every unfinished task in the database
    Recover,
}

#[derive(Serialize)]
struct Validated {
    valid: bool,
    nodes: usize,
    edges: usize,
    generations: Vec<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let actor = Actor::new(cli.actor.clone());

    if let Command::Validate { graph } = &cli.command {
        let graph = load_graph(graph)?;
        return print_json(&Validated {
            valid: true,
            nodes: graph.len(),
            edges: graph.edges().len(),
            generations: graph.generations(),
        });
    }

    let engine = open_engine(&cli)?;

    match cli.command {
        Command::Validate { .. } => Ok(()),
        Command::Run { graph, workflow } => {
            let spec = GraphSpec::from_file(&graph)?;
            let workflow_id = workflow.unwrap_or_else(|| {
                graph
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workflow".to_string())
            });
            let task_id = engine
                .submit(Submission { workflow_id, graph: spec }, &actor)
                .await
                .with_context(|| format!("submitting {}", graph.display()))?;
            print_json(&engine.wait_settled(&task_id).await?)
        }
        Command::Status { task_id } => print_json(&engine.status(&task_id).await?),
        Command::Results { task_id } => print_json(&engine.results(&task_id).await?),
        Command::Resume {
            task_id,
            node_id,
            input,
        } => {
            let outcome = engine.resume(&task_id, &node_id, &input, &actor).await?;
            let task = engine.wait_settled(&task_id).await?;
            print_json(&serde_json::json!({ "resume": outcome, "task": task }))
        }
        Command::Cancel { task_id } => {
            engine.cancel(&task_id, &actor).await?;
            print_json(&engine.wait_finished(&task_id).await?)
        }
        Command::Recover => {
            let mut reports = Vec::new();
            for task_id in engine.recover().await? {
                reports.push(engine.wait_settled(&task_id).await?);
            }
            print_json(&reports)
        }
    }
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let db = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path(),
    };
    log::debug!("Using database {}", db.display());
    let store = SqliteStore::open(&db).with_context(|| format!("opening database {}", db.display()))?;
    Ok(Engine::new(Arc::new(store), Arc::new(EchoExecutor), config)?)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dagrun")
        .join("dagrun.db")
}

fn load_graph(path: &Path) -> Result<Graph> {
    let spec = GraphSpec::from_file(path)?;
    let graph = Graph::from_spec(spec).with_context(|| format!("validating {}", path.display()))?;
    Ok(graph)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
