//! Stage definitions and fan-out planning.
//!
//! A [`StageDefinition`] describes one external tool in the pipeline: the
//! command template, where its invocations write, which files count as its
//! artifacts, and how it fans out over the artifacts of the previous stage.
//! [`StageDefinition::plan`] turns a definition plus its inputs into the
//! concrete [`Invocation`]s the controller runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use binderflow_exec::executor::DEFAULT_TIMEOUT;
use binderflow_exec::{Invocation, OutputPattern};
use binderflow_types::{Artifact, BinderflowError, Result};
use serde::{Deserialize, Serialize};

use crate::duration_serde;

/// How a stage consumes the artifacts of the previous stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FanOut {
    /// One invocation per input artifact, considering at most `max_inputs`
    /// of them in discovery order. Inputs beyond the bound are skipped.
    PerInput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_inputs: Option<usize>,
    },
    /// A single invocation over every input artifact.
    Gather,
}

impl Default for FanOut {
    fn default() -> Self {
        FanOut::PerInput { max_inputs: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Human description, used in logs and failure messages.
    pub description: String,
    pub program: String,
    /// Argument templates. See [`expand_args`] for the available variables.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the process. Defaults to the invocation's output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Stage output directory, relative to the work root.
    pub output_dir: String,
    /// Invocation directories are `<output_dir>/<invocation_prefix>_<n>`.
    #[serde(default = "default_invocation_prefix")]
    pub invocation_prefix: String,
    /// What one input is called in invocation descriptions ("scaffold", "sequence").
    #[serde(default = "default_input_label")]
    pub input_label: String,
    /// Glob, relative to an invocation directory, selecting the stage's artifacts.
    pub output_pattern: String,
    #[serde(default)]
    pub fan_out: FanOut,
    /// Number of outputs each invocation is configured to produce.
    #[serde(default = "default_multiplicity")]
    pub multiplicity: usize,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_invocation_prefix() -> String {
    "run".to_string()
}

fn default_input_label() -> String {
    "input".to_string()
}

fn default_multiplicity() -> usize {
    1
}

/// One concrete invocation of a stage.
#[derive(Debug, Clone)]
pub struct PlannedInvocation {
    /// 1-based position within the stage.
    pub index: usize,
    /// 0-based index of the consumed input; `None` for gather stages.
    pub source_index: Option<usize>,
    pub output_dir: PathBuf,
    pub invocation: Invocation,
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub invocations: Vec<PlannedInvocation>,
    /// Inputs not considered because of the stage's input bound.
    pub skipped: usize,
}

/// Outcome of one stage within a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub state: StageState,
    pub invocations: usize,
    pub artifacts: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            state: StageState::Pending,
            invocations: 0,
            artifacts: 0,
            skipped: 0,
            duration_ms: 0,
        }
    }
}

impl StageDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        program: impl Into<String>,
        output_dir: impl Into<String>,
        output_pattern: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
            output_dir: output_dir.into(),
            invocation_prefix: default_invocation_prefix(),
            input_label: default_input_label(),
            output_pattern: output_pattern.into(),
            fan_out: FanOut::default(),
            multiplicity: 1,
            params: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocation_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.invocation_prefix = prefix.into();
        self
    }

    pub fn input_label(mut self, label: impl Into<String>) -> Self {
        self.input_label = label.into();
        self
    }

    pub fn fan_out(mut self, fan_out: FanOut) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn multiplicity(mut self, multiplicity: usize) -> Self {
        self.multiplicity = multiplicity;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn pattern(&self) -> Result<OutputPattern> {
        OutputPattern::new(&self.output_pattern)
    }

    pub fn validate(&self) -> Result<()> {
        let fail =
            |msg: &str| Err(BinderflowError::Config(format!("stage '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(BinderflowError::Config("stage name must not be empty".into()));
        }
        if self.program.trim().is_empty() {
            return fail("program must not be empty");
        }
        if self.output_dir.is_empty() || Path::new(&self.output_dir).is_absolute() {
            return fail("output_dir must be a non-empty relative path");
        }
        if self.invocation_prefix.is_empty() || self.invocation_prefix.contains('/') {
            return fail("invocation_prefix must be a plain, non-empty name");
        }
        if self.multiplicity == 0 {
            return fail("multiplicity must be at least 1");
        }
        if self.timeout.is_zero() {
            return fail("timeout must be positive");
        }
        if let FanOut::PerInput { max_inputs: Some(0) } = self.fan_out {
            return fail("max_inputs must be at least 1");
        }
        self.pattern()?;
        Ok(())
    }

    /// Plan this stage's invocations over `inputs`.
    ///
    /// Per-input stages get one invocation per input (after applying the
    /// input bound); gather stages get exactly one. Invocation directories are
    /// `<work_root>/<output_dir>/<invocation_prefix>_<n>` with `n` 1-based, so
    /// no two invocations share a directory.
    pub fn plan(&self, inputs: &[Artifact], work_root: &Path) -> Result<StagePlan> {
        if inputs.is_empty() {
            return Err(BinderflowError::Other(format!(
                "stage '{}' has no input artifacts",
                self.name
            )));
        }

        let stage_root = work_root.join(&self.output_dir);
        let mut invocations = Vec::new();
        let mut skipped = 0;

        match self.fan_out {
            FanOut::PerInput { max_inputs } => {
                let considered = max_inputs.map_or(inputs.len(), |max| max.min(inputs.len()));
                skipped = inputs.len() - considered;
                for (i, input) in inputs.iter().take(considered).enumerate() {
                    let index = i + 1;
                    let output_dir =
                        stage_root.join(format!("{}_{}", self.invocation_prefix, index));
                    let description =
                        format!("{} for {} {}", self.description, self.input_label, index);
                    let invocation = self.build_invocation(
                        description,
                        std::slice::from_ref(input),
                        &output_dir,
                        index,
                        work_root,
                    );
                    invocations.push(PlannedInvocation {
                        index,
                        source_index: Some(i),
                        output_dir,
                        invocation,
                    });
                }
            }
            FanOut::Gather => {
                let output_dir = stage_root.join(format!("{}_1", self.invocation_prefix));
                let invocation = self.build_invocation(
                    self.description.clone(),
                    inputs,
                    &output_dir,
                    1,
                    work_root,
                );
                invocations.push(PlannedInvocation {
                    index: 1,
                    source_index: None,
                    output_dir,
                    invocation,
                });
            }
        }

        Ok(StagePlan { invocations, skipped })
    }

    fn build_invocation(
        &self,
        description: String,
        inputs: &[Artifact],
        output_dir: &Path,
        index: usize,
        work_root: &Path,
    ) -> Invocation {
        let mut vars: HashMap<String, String> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(first) = inputs.first() {
            vars.insert("input".into(), first.path.display().to_string());
        }
        vars.insert("output_dir".into(), output_dir.display().to_string());
        vars.insert("index".into(), index.to_string());
        vars.insert("multiplicity".into(), self.multiplicity.to_string());
        vars.insert("work_root".into(), work_root.display().to_string());

        let input_paths: Vec<String> =
            inputs.iter().map(|a| a.path.display().to_string()).collect();
        let args = expand_args(&self.args, &vars, &input_paths);

        Invocation::new(description, self.program.clone())
            .args(args)
            .working_dir(self.working_dir.clone().unwrap_or_else(|| output_dir.to_path_buf()))
            .timeout(self.timeout)
    }
}

/// Expand argument templates.
///
/// An argument that is exactly `${inputs}` becomes one argument per input
/// path; anywhere else `${inputs}` is the space-joined list. Every other
/// `${key}` is looked up in `vars`.
pub fn expand_args(
    templates: &[String],
    vars: &HashMap<String, String>,
    inputs: &[String],
) -> Vec<String> {
    let mut args = Vec::with_capacity(templates.len());
    for template in templates {
        if template == "${inputs}" {
            args.extend(inputs.iter().cloned());
            continue;
        }
        let expanded = expand_variables(template, vars);
        if expanded.contains("${inputs}") {
            args.push(expanded.replace("${inputs}", &inputs.join(" ")));
        } else {
            args.push(expanded);
        }
    }
    args
}

/// Replace `${key}` occurrences in `template` with values from `vars`.
///
/// Expansion is a single left-to-right pass, so substituted values are never
/// re-expanded. Unknown keys are left verbatim.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match vars.get(key) {
                    Some(value) => result.push_str(value),
                    None => {
                        result.push_str("${");
                        result.push_str(key);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn artifacts(n: usize) -> Vec<Artifact> {
        (0..n)
            .map(|i| Artifact::new(format!("/work/prev/out_{i}.pdb"), "prev", Some(i)))
            .collect()
    }

    fn mpnn_stage() -> StageDefinition {
        StageDefinition::new(
            "proteinmpnn",
            "sequence design",
            "python",
            "proteinmpnn_output",
            "**/seqs/*.fa",
        )
        .invocation_prefix("scaffold")
        .input_label("scaffold")
        .multiplicity(5)
        .param("sampling_temp", "0.1")
        .args([
            "run.py",
            "--pdb_path",
            "${input}",
            "--out_folder",
            "${output_dir}",
            "--num_seq_per_target",
            "${multiplicity}",
            "--sampling_temp",
            "${sampling_temp}",
        ])
    }

    // ---- expand_variables ----

    #[test]
    fn expand_single_variable() {
        assert_eq!(
            expand_variables("inference.input_pdb=${input}", &vars(&[("input", "/w/target.pdb")])),
            "inference.input_pdb=/w/target.pdb"
        );
    }

    #[test]
    fn expand_multiple_variables() {
        let v = vars(&[("output_dir", "/w/out"), ("index", "2")]);
        assert_eq!(expand_variables("${output_dir}/binder_${index}", &v), "/w/out/binder_2");
    }

    #[test]
    fn expand_unknown_variable_left_verbatim() {
        assert_eq!(expand_variables("x=${unknown}", &HashMap::new()), "x=${unknown}");
    }

    #[test]
    fn expand_unterminated_left_verbatim() {
        assert_eq!(expand_variables("x=${input", &vars(&[("input", "a")])), "x=${input");
    }

    #[test]
    fn expanded_values_are_not_re_expanded() {
        let v = vars(&[("a", "${b}"), ("b", "nope")]);
        assert_eq!(expand_variables("${a}", &v), "${b}");
    }

    #[test]
    fn contig_brackets_pass_through() {
        let v = vars(&[("contigs", "[A1-100/0 70-100]")]);
        assert_eq!(
            expand_variables("contigmap.contigs=${contigs}", &v),
            "contigmap.contigs=[A1-100/0 70-100]"
        );
    }

    #[test]
    fn inputs_expands_to_separate_arguments() {
        let args = expand_args(
            &["--files".to_string(), "${inputs}".to_string(), "--list=${inputs}".to_string()],
            &HashMap::new(),
            &["a.fa".to_string(), "b.fa".to_string()],
        );
        assert_eq!(args, vec!["--files", "a.fa", "b.fa", "--list=a.fa b.fa"]);
    }

    // ---- plan ----

    #[test]
    fn per_input_plan_one_invocation_per_input() {
        let stage = mpnn_stage();
        let plan = stage.plan(&artifacts(3), Path::new("/work")).unwrap();

        assert_eq!(plan.invocations.len(), 3);
        assert_eq!(plan.skipped, 0);

        let second = &plan.invocations[1];
        assert_eq!(second.index, 2);
        assert_eq!(second.source_index, Some(1));
        assert_eq!(second.output_dir, PathBuf::from("/work/proteinmpnn_output/scaffold_2"));
        assert_eq!(second.invocation.description, "sequence design for scaffold 2");
        assert_eq!(
            second.invocation.args,
            vec![
                "run.py",
                "--pdb_path",
                "/work/prev/out_1.pdb",
                "--out_folder",
                "/work/proteinmpnn_output/scaffold_2",
                "--num_seq_per_target",
                "5",
                "--sampling_temp",
                "0.1",
            ]
        );
        assert_eq!(second.invocation.working_dir, second.output_dir);
    }

    #[test]
    fn per_input_bound_skips_excess_inputs() {
        let stage = mpnn_stage().fan_out(FanOut::PerInput { max_inputs: Some(3) });
        let plan = stage.plan(&artifacts(5), Path::new("/work")).unwrap();
        assert_eq!(plan.invocations.len(), 3);
        assert_eq!(plan.skipped, 2);
        assert_eq!(plan.invocations[2].source_index, Some(2));
    }

    #[test]
    fn bound_larger_than_inputs_skips_nothing() {
        let stage = mpnn_stage().fan_out(FanOut::PerInput { max_inputs: Some(10) });
        let plan = stage.plan(&artifacts(2), Path::new("/work")).unwrap();
        assert_eq!(plan.invocations.len(), 2);
        assert_eq!(plan.skipped, 0);
    }

    #[test]
    fn gather_plan_single_invocation_over_all_inputs() {
        let stage = StageDefinition::new("merge", "merge", "cat", "merged", "*.txt")
            .fan_out(FanOut::Gather)
            .invocation_prefix("batch")
            .args(["${inputs}"]);
        let plan = stage.plan(&artifacts(3), Path::new("/work")).unwrap();

        assert_eq!(plan.invocations.len(), 1);
        let only = &plan.invocations[0];
        assert_eq!(only.source_index, None);
        assert_eq!(only.output_dir, PathBuf::from("/work/merged/batch_1"));
        assert_eq!(only.invocation.description, "merge");
        assert_eq!(only.invocation.args.len(), 3);
    }

    #[test]
    fn explicit_working_dir_and_timeout_are_used() {
        let stage = mpnn_stage()
            .working_dir("/opt/proteinmpnn")
            .timeout(Duration::from_secs(60));
        let plan = stage.plan(&artifacts(1), Path::new("/work")).unwrap();
        let inv = &plan.invocations[0].invocation;
        assert_eq!(inv.working_dir, PathBuf::from("/opt/proteinmpnn"));
        assert_eq!(inv.timeout, Duration::from_secs(60));
    }

    #[test]
    fn plan_without_inputs_is_an_error() {
        assert!(mpnn_stage().plan(&[], Path::new("/work")).is_err());
    }

    // ---- validate / serde ----

    #[test]
    fn validate_rejects_bad_definitions() {
        assert!(mpnn_stage().validate().is_ok());
        assert!(mpnn_stage().multiplicity(0).validate().is_err());
        assert!(mpnn_stage()
            .fan_out(FanOut::PerInput { max_inputs: Some(0) })
            .validate()
            .is_err());
        assert!(mpnn_stage().timeout(Duration::ZERO).validate().is_err());

        let mut absolute = mpnn_stage();
        absolute.output_dir = "/tmp/out".into();
        assert!(absolute.validate().is_err());

        let mut bad_glob = mpnn_stage();
        bad_glob.output_pattern = "seqs/[".into();
        assert!(matches!(bad_glob.validate(), Err(BinderflowError::Config(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "name": "colabfold",
            "description": "structure prediction",
            "program": "colabfold_batch",
            "args": ["${input}", "${output_dir}"],
            "output_dir": "colabfold_output",
            "output_pattern": "*.pdb",
            "fan_out": { "mode": "per_input", "max_inputs": 3 },
            "timeout": "30m"
        }"#;
        let stage: StageDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(stage.fan_out, FanOut::PerInput { max_inputs: Some(3) });
        assert_eq!(stage.timeout, Duration::from_secs(1800));
        assert_eq!(stage.multiplicity, 1);
        assert_eq!(stage.invocation_prefix, "run");
        assert!(stage.working_dir.is_none());
    }

    #[test]
    fn gather_deserializes_from_mode_tag() {
        let fan_out: FanOut = serde_json::from_str(r#"{ "mode": "gather" }"#).unwrap();
        assert_eq!(fan_out, FanOut::Gather);
        let default: FanOut = serde_json::from_str(r#"{ "mode": "per_input" }"#).unwrap();
        assert_eq!(default, FanOut::PerInput { max_inputs: None });
    }
}
