//! `binderflow`: runs one binder design job end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use binderflow_pipeline::duration_serde::parse_duration_str;
use binderflow_pipeline::{
    load_stages, DesignParameters, DirectoryPublisher, JobDescriptor, JsonFileStatusStore,
    LocalFetcher, PipelineConfig, PipelineController, StatusStore, ToolPaths,
};
use binderflow_types::Cancellation;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "binderflow", version, about = "Protein binder design pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job: generate, design, predict, rank and publish binders
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Job identifier (default: random UUID)
        #[arg(long, env = "JOB_ID")]
        job_id: Option<String>,

        /// Input structure: a local path or file:// URI
        #[arg(long, env = "INPUT_KEY")]
        input: String,

        /// Human-readable target name (default: input file stem)
        #[arg(long, env = "PDB_NAME")]
        label: Option<String>,

        /// Directory holding one JSON status record per job
        #[arg(long, env = "STATUS_DIR")]
        status_dir: Option<PathBuf>,

        /// Root results are published under, as results/<job_id>/
        #[arg(long, env = "PUBLISH_ROOT")]
        publish_root: Option<PathBuf>,
    },

    /// Validate the pipeline configuration without running anything
    Validate {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Print the stage list as JSON
    Stages {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Show a job's status record
    Status {
        job_id: String,

        #[arg(long, env = "STATUS_DIR")]
        status_dir: PathBuf,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Root for job-local files
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/binderflow")]
    work_dir: PathBuf,

    /// JSON file with the stage list, replacing the built-in binder design stages
    #[arg(long)]
    stages: Option<PathBuf>,

    #[arg(long, env = "RFDIFFUSION_MODEL_PATH", default_value = "/work/rfdiffusion/models")]
    rfdiffusion_models: PathBuf,

    #[arg(
        long,
        env = "PROTEINMPNN_MODEL_PATH",
        default_value = "/work/proteinmpnn/vanilla_model_weights"
    )]
    proteinmpnn_weights: PathBuf,

    #[arg(long, env = "COLABFOLD_DB_PATH", default_value = "/work/colabfold/databases")]
    colabfold_db: PathBuf,

    /// Number of results to keep
    #[arg(long, default_value_t = 3)]
    top_k: usize,

    /// Concurrent invocations within a stage
    #[arg(long, default_value_t = 1)]
    max_concurrency: usize,

    /// Backbones generated by RFdiffusion
    #[arg(long, default_value_t = 3)]
    num_designs: usize,

    /// Sequences designed per backbone
    #[arg(long, default_value_t = 5)]
    sequences_per_scaffold: usize,

    /// Sequences sent to structure prediction
    #[arg(long, default_value_t = 3)]
    max_structures: usize,

    /// Per-invocation timeout, e.g. "90m"
    #[arg(long, default_value = "1h", value_parser = parse_duration_str)]
    stage_timeout: Duration,

    /// Abort the whole job after this long, e.g. "6h"
    #[arg(long, value_parser = parse_duration_str)]
    pipeline_timeout: Option<Duration>,

    /// Rank structures without a confidence annotation after scored ones
    #[arg(long)]
    include_unscored: bool,
}

impl PipelineArgs {
    fn build(&self, work_root: PathBuf) -> anyhow::Result<PipelineConfig> {
        let tools = ToolPaths {
            rfdiffusion_models: self.rfdiffusion_models.clone(),
            proteinmpnn_weights: self.proteinmpnn_weights.clone(),
            colabfold_databases: self.colabfold_db.clone(),
            ..ToolPaths::default()
        };
        let params = DesignParameters {
            num_designs: self.num_designs,
            sequences_per_scaffold: self.sequences_per_scaffold,
            max_structures: self.max_structures,
            stage_timeout: self.stage_timeout,
            ..DesignParameters::default()
        };

        let mut config = PipelineConfig::binder_design(work_root, &tools, &params);
        if let Some(path) = &self.stages {
            config.stages = load_stages(path)
                .with_context(|| format!("failed to load stages from {}", path.display()))?;
        }
        config.top_k = self.top_k;
        config.max_concurrency = self.max_concurrency;
        config.pipeline_timeout = self.pipeline_timeout;
        config.include_unscored = self.include_unscored;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Run {
            pipeline,
            job_id,
            input,
            label,
            status_dir,
            publish_root,
        } => {
            cmd_run(&pipeline, job_id, input, label, status_dir, publish_root).await?;
        }
        Commands::Validate { pipeline } => {
            let config = pipeline.build(pipeline.work_dir.clone())?;
            println!("Configuration is valid ({} stages)", config.stages.len());
        }
        Commands::Stages { pipeline } => {
            let config = pipeline.build(pipeline.work_dir.clone())?;
            println!("{}", serde_json::to_string_pretty(&config.stages)?);
        }
        Commands::Status { job_id, status_dir } => {
            let store = JsonFileStatusStore::new(status_dir);
            match store.get(&job_id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => anyhow::bail!("no status record for job '{}'", job_id),
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn label_from_input(input: &str) -> String {
    Path::new(input.strip_prefix("file://").unwrap_or(input))
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string())
}

async fn cmd_run(
    pipeline: &PipelineArgs,
    job_id: Option<String>,
    input: String,
    label: Option<String>,
    status_dir: Option<PathBuf>,
    publish_root: Option<PathBuf>,
) -> anyhow::Result<()> {
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let label = label.unwrap_or_else(|| label_from_input(&input));
    let job = JobDescriptor::new(job_id, input, label);

    let work_root = pipeline.work_dir.join(&job.id);
    let config = pipeline.build(work_root.clone())?;
    let status_dir = status_dir.unwrap_or_else(|| pipeline.work_dir.join("status"));
    let publish_root = publish_root.unwrap_or_else(|| pipeline.work_dir.join("published"));

    let store = Arc::new(JsonFileStatusStore::new(&status_dir));
    if store.get(&job.id).await?.is_none() {
        store.insert(&job.to_job()).await?;
    }

    let controller = PipelineController::new(
        config,
        Arc::new(LocalFetcher::new()),
        store,
        Arc::new(DirectoryPublisher::new(&publish_root)),
    )?;

    let cancel = Cancellation::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel("interrupted");
        }
    });

    println!("Job: {} ({})", job.id, job.label);
    println!("Work dir: {}", work_root.display());

    let result = controller
        .run_with_cancellation(&job, cancel)
        .await
        .with_context(|| format!("job {} failed", job.id))?;

    println!("\nSelected designs:");
    for selected in &result.selected {
        println!(
            "  {}  confidence={}  from {}",
            selected.file, selected.score, selected.source_file
        );
    }
    println!("Results: {}", result.results_dir.display());
    for location in &result.published {
        println!("  {}", location);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use binderflow_pipeline::FanOut;

    #[test]
    fn label_defaults_to_input_stem() {
        assert_eq!(label_from_input("/data/uploads/6XYZ.pdb"), "6XYZ");
        assert_eq!(label_from_input("file:///data/PD-L1.cif"), "PD-L1");
    }

    #[test]
    fn run_flags_build_binder_design_config() {
        let cli = Cli::try_parse_from([
            "binderflow",
            "run",
            "--input",
            "/data/6XYZ.pdb",
            "--work-dir",
            "/scratch",
            "--num-designs",
            "4",
            "--max-structures",
            "2",
            "--pipeline-timeout",
            "6h",
        ])
        .unwrap();

        let Commands::Run { pipeline, input, .. } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(input, "/data/6XYZ.pdb");

        let config = pipeline.build(PathBuf::from("/scratch/job-1")).unwrap();
        assert_eq!(config.stages[0].multiplicity, 4);
        assert_eq!(config.stages[2].fan_out, FanOut::PerInput { max_inputs: Some(2) });
        assert_eq!(config.pipeline_timeout, Some(Duration::from_secs(6 * 3600)));
        assert_eq!(config.stages[1].timeout, Duration::from_secs(3600));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let cli = Cli::try_parse_from(["binderflow", "validate", "--top-k", "0"]).unwrap();
        let Commands::Validate { pipeline } = cli.command else {
            panic!("expected validate command");
        };
        assert!(pipeline.build(PathBuf::from("/scratch")).is_err());
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let parsed = Cli::try_parse_from(["binderflow", "validate", "--stage-timeout", "soon"]);
        assert!(parsed.is_err());
    }
}
