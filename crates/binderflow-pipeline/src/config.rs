//! Pipeline configuration and the job descriptor.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use binderflow_exec::executor::DEFAULT_TIMEOUT;
use binderflow_types::{BinderflowError, Job, Result};
use serde::{Deserialize, Serialize};

use crate::duration_serde;
use crate::retry::BackoffPolicy;
use crate::stage::{FanOut, StageDefinition};

pub const DEFAULT_PIPELINE_VERSION: &str = "rfdiffusion-proteinmpnn-colabfold-v1.0";
pub const DEFAULT_METRICS_FILE: &str = "confidence_metrics.json";

/// Everything the controller needs besides the job itself. Immutable once
/// handed to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of all job-local directories (input, stage outputs, results).
    pub work_root: PathBuf,
    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Concurrent invocations within a stage.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default, with = "duration_serde::option")]
    pub pipeline_timeout: Option<Duration>,
    /// Rank unscored final artifacts after every scored one instead of excluding them.
    #[serde(default)]
    pub include_unscored: bool,
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    #[serde(default = "default_result_prefix")]
    pub result_prefix: String,
    #[serde(default = "default_metrics_file")]
    pub metrics_file: String,
    /// Token that marks the confidence value in a `REMARK` line.
    #[serde(default = "default_confidence_keyword")]
    pub confidence_keyword: String,
    /// Retries after the first attempt of a status, fetch or publish call.
    #[serde(default = "default_collaborator_retries")]
    pub collaborator_retries: usize,
    /// Deadline for a single collaborator call attempt.
    #[serde(default = "default_collaborator_timeout", with = "duration_serde")]
    pub collaborator_timeout: Duration,
    #[serde(skip)]
    pub backoff: BackoffPolicy,
}

fn default_top_k() -> usize {
    3
}

fn default_max_concurrency() -> usize {
    1
}

fn default_pipeline_version() -> String {
    DEFAULT_PIPELINE_VERSION.to_string()
}

fn default_result_prefix() -> String {
    "result".to_string()
}

fn default_metrics_file() -> String {
    DEFAULT_METRICS_FILE.to_string()
}

fn default_confidence_keyword() -> String {
    "CONFIDENCE".to_string()
}

fn default_collaborator_retries() -> usize {
    2
}

fn default_collaborator_timeout() -> Duration {
    Duration::from_secs(300)
}

impl PipelineConfig {
    pub fn new(work_root: impl Into<PathBuf>, stages: Vec<StageDefinition>) -> Self {
        Self {
            work_root: work_root.into(),
            stages,
            top_k: default_top_k(),
            max_concurrency: default_max_concurrency(),
            pipeline_timeout: None,
            include_unscored: false,
            pipeline_version: default_pipeline_version(),
            result_prefix: default_result_prefix(),
            metrics_file: default_metrics_file(),
            confidence_keyword: default_confidence_keyword(),
            collaborator_retries: default_collaborator_retries(),
            collaborator_timeout: default_collaborator_timeout(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// The fixed three-stage binder design pipeline: RFdiffusion backbone
    /// generation, ProteinMPNN sequence design per scaffold, ColabFold
    /// structure prediction per sequence.
    pub fn binder_design(
        work_root: impl Into<PathBuf>,
        tools: &ToolPaths,
        params: &DesignParameters,
    ) -> Self {
        let mut config = Self::new(work_root, binder_design_stages(tools, params));
        config.result_prefix = "designed_binder".to_string();
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(BinderflowError::Config("at least one stage is required".into()));
        }
        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !names.insert(stage.name.as_str()) {
                return Err(BinderflowError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if !dirs.insert(stage.output_dir.as_str()) {
                return Err(BinderflowError::Config(format!(
                    "stages share output directory '{}'",
                    stage.output_dir
                )));
            }
        }
        if self.top_k == 0 {
            return Err(BinderflowError::Config("top_k must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(BinderflowError::Config("max_concurrency must be at least 1".into()));
        }
        if self.result_prefix.is_empty() || self.result_prefix.contains('/') {
            return Err(BinderflowError::Config(
                "result_prefix must be a plain, non-empty name".into(),
            ));
        }
        if self.metrics_file.is_empty() || self.metrics_file.contains('/') {
            return Err(BinderflowError::Config("metrics_file must be a plain file name".into()));
        }
        if self.confidence_keyword.trim().is_empty() {
            return Err(BinderflowError::Config("confidence_keyword must not be empty".into()));
        }
        if self.pipeline_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BinderflowError::Config("pipeline_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn input_dir(&self) -> PathBuf {
        self.work_root.join("input")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.work_root.join("results")
    }

    /// Per-stage parameters recorded in the metrics document.
    pub fn stage_parameters(&self) -> BTreeMap<String, serde_json::Value> {
        self.stages
            .iter()
            .map(|stage| {
                let max_inputs = match stage.fan_out {
                    FanOut::PerInput { max_inputs } => max_inputs,
                    FanOut::Gather => None,
                };
                let value = serde_json::json!({
                    "multiplicity": stage.multiplicity,
                    "fan_out": stage.fan_out,
                    "max_inputs": max_inputs,
                    "timeout_secs": stage.timeout.as_secs(),
                    "params": stage.params,
                });
                (stage.name.clone(), value)
            })
            .collect()
    }
}

/// Read a JSON array of stage definitions.
pub fn load_stages(path: &Path) -> Result<Vec<StageDefinition>> {
    let content = std::fs::read_to_string(path)?;
    let stages: Vec<StageDefinition> = serde_json::from_str(&content)?;
    Ok(stages)
}

/// Locations of the external tools and their model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    pub python: String,
    pub rfdiffusion_dir: PathBuf,
    pub rfdiffusion_models: PathBuf,
    pub proteinmpnn_dir: PathBuf,
    pub proteinmpnn_weights: PathBuf,
    pub colabfold_program: String,
    pub colabfold_dir: PathBuf,
    pub colabfold_databases: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            python: "python".into(),
            rfdiffusion_dir: PathBuf::from("/work/rfdiffusion"),
            rfdiffusion_models: PathBuf::from("/work/rfdiffusion/models"),
            proteinmpnn_dir: PathBuf::from("/work/proteinmpnn"),
            proteinmpnn_weights: PathBuf::from("/work/proteinmpnn/vanilla_model_weights"),
            colabfold_program: "colabfold_batch".into(),
            colabfold_dir: PathBuf::from("/work/colabfold"),
            colabfold_databases: PathBuf::from("/work/colabfold/databases"),
        }
    }
}

/// Tunables of the binder design pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignParameters {
    pub num_designs: usize,
    pub contigs: String,
    pub sequences_per_scaffold: usize,
    pub sampling_temperature: f64,
    pub chains: String,
    pub colabfold_models: usize,
    pub max_msa: String,
    pub max_structures: usize,
    #[serde(with = "duration_serde")]
    pub stage_timeout: Duration,
}

impl Default for DesignParameters {
    fn default() -> Self {
        Self {
            num_designs: 3,
            contigs: "[A1-100/0 70-100]".into(),
            sequences_per_scaffold: 5,
            sampling_temperature: 0.1,
            chains: "A".into(),
            colabfold_models: 1,
            max_msa: "32:128".into(),
            max_structures: 3,
            stage_timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn path_param(path: &Path) -> String {
    path.display().to_string()
}

fn binder_design_stages(tools: &ToolPaths, params: &DesignParameters) -> Vec<StageDefinition> {
    let rfdiffusion = StageDefinition::new(
        "rfdiffusion",
        "RFdiffusion backbone generation",
        tools.python.clone(),
        "rfdiffusion_output",
        "binder_*.pdb",
    )
    .args([
        "${rfdiffusion_dir}/scripts/run_inference.py",
        "inference.input_pdb=${input}",
        "inference.output_prefix=${output_dir}/binder",
        "inference.num_designs=${multiplicity}",
        "contigmap.contigs=${contigs}",
        "inference.ckpt_override_path=${models}/Base_ckpt.pt",
    ])
    .working_dir(tools.rfdiffusion_dir.clone())
    .timeout(params.stage_timeout)
    .invocation_prefix("design")
    .input_label("target")
    .fan_out(FanOut::Gather)
    .multiplicity(params.num_designs)
    .param("rfdiffusion_dir", path_param(&tools.rfdiffusion_dir))
    .param("models", path_param(&tools.rfdiffusion_models))
    .param("contigs", params.contigs.clone());

    let proteinmpnn = StageDefinition::new(
        "proteinmpnn",
        "ProteinMPNN sequence design",
        tools.python.clone(),
        "proteinmpnn_output",
        "**/seqs/*.fa",
    )
    .args([
        "${proteinmpnn_dir}/protein_mpnn_run.py",
        "--pdb_path",
        "${input}",
        "--pdb_path_chains",
        "${chains}",
        "--out_folder",
        "${output_dir}",
        "--num_seq_per_target",
        "${multiplicity}",
        "--sampling_temp",
        "${sampling_temp}",
        "--batch_size",
        "1",
        "--path_to_model_weights",
        "${weights}",
    ])
    .working_dir(tools.proteinmpnn_dir.clone())
    .timeout(params.stage_timeout)
    .invocation_prefix("scaffold")
    .input_label("scaffold")
    .multiplicity(params.sequences_per_scaffold)
    .param("proteinmpnn_dir", path_param(&tools.proteinmpnn_dir))
    .param("weights", path_param(&tools.proteinmpnn_weights))
    .param("chains", params.chains.clone())
    .param("sampling_temp", params.sampling_temperature.to_string());

    let colabfold = StageDefinition::new(
        "colabfold",
        "ColabFold structure prediction",
        tools.colabfold_program.clone(),
        "colabfold_output",
        "*.pdb",
    )
    .args([
        "${input}",
        "${output_dir}",
        "--num-models",
        "${multiplicity}",
        "--max-msa",
        "${max_msa}",
        "--use-gpu-relax",
        "--amber",
        "--num-relax",
        "1",
    ])
    .working_dir(tools.colabfold_dir.clone())
    .timeout(params.stage_timeout)
    .invocation_prefix("prediction")
    .input_label("sequence")
    .fan_out(FanOut::PerInput {
        max_inputs: Some(params.max_structures),
    })
    .multiplicity(params.colabfold_models)
    .param("max_msa", params.max_msa.clone())
    .param("databases", path_param(&tools.colabfold_databases));

    vec![rfdiffusion, proteinmpnn, colabfold]
}

/// The unit of work handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    /// Location of the starting structure, resolved by the input fetcher.
    pub input_ref: String,
    /// Human-readable name of the target.
    pub label: String,
}

impl JobDescriptor {
    pub fn new(
        id: impl Into<String>,
        input_ref: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input_ref: input_ref.into(),
            label: label.into(),
        }
    }

    /// A fresh `PENDING` record for this job.
    pub fn to_job(&self) -> Job {
        Job::new(self.id.clone(), self.input_ref.clone(), self.label.clone())
    }
}
