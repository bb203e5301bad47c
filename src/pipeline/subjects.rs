//! Running the LOGISMOS-B workflow over a batch of subjects.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::logismosb::{check_edge_probability_inputs, create_logb_workflow, INPUTS, ML_INPUTS};
use crate::core::config::PipelineConfig;
use crate::core::errors::{LogisError, Result};
use crate::dag_flow::{ExecutionReport, LocalExecutor, Workflow};

/// Boundary inputs of one subject session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub session_id: String,
    pub t1_file: PathBuf,
    #[serde(default)]
    pub t2_file: Option<PathBuf>,
    pub csf_file: PathBuf,
    pub fswm_atlas: PathBuf,
    pub brainlabels_file: PathBuf,
    pub hncma_atlas: PathBuf,
    /// Edge-probability features, needed when `maclearn` is configured
    #[serde(default)]
    pub rho: Option<PathBuf>,
    #[serde(default)]
    pub phi: Option<PathBuf>,
    #[serde(default)]
    pub theta: Option<PathBuf>,
    #[serde(default, deserialize_with = "posterior_cell")]
    pub posteriors: Option<BTreeMap<String, PathBuf>>,
    #[serde(default)]
    pub acpc_transform: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Posteriors {
    Map(BTreeMap<String, PathBuf>),
    Text(String),
}

/// Posteriors as a map, or in a CSV cell as `NAME=path;NAME=path`
fn posterior_cell<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<BTreeMap<String, PathBuf>>, D::Error> {
    let text = match Option::<Posteriors>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Posteriors::Map(map)) => return Ok(Some(map)),
        Some(Posteriors::Text(text)) => text,
    };
    let mut posteriors = BTreeMap::new();
    for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, path) = entry.split_once('=').ok_or_else(|| {
            <D::Error as serde::de::Error>::custom(format!("posterior '{entry}' is not NAME=path"))
        })?;
        posteriors.insert(name.trim().to_string(), PathBuf::from(path.trim()));
    }
    Ok((!posteriors.is_empty()).then_some(posteriors))
}

impl SubjectRecord {
    /// `(input port, value)` for every field that is set
    pub fn input_values(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Path| p.to_string_lossy().into_owned();
        let mut values = vec![
            ("subject_id", self.subject_id.clone()),
            ("session_id", self.session_id.clone()),
            ("t1_file", path(&self.t1_file)),
            ("csf_file", path(&self.csf_file)),
            ("fswm_atlas", path(&self.fswm_atlas)),
            ("brainlabels_file", path(&self.brainlabels_file)),
            ("hncma_atlas", path(&self.hncma_atlas)),
        ];
        if let Some(t2) = &self.t2_file {
            values.push(("t2_file", path(t2)));
        }
        values
    }

    /// `(MLInputs port, value)` for every edge-probability input that is set
    pub fn edge_probability_values(&self) -> Vec<(&'static str, Value)> {
        let path = |p: &Path| Value::from(p.to_string_lossy().into_owned());
        let mut values = Vec::new();
        for (port, file) in [
            ("rho", &self.rho),
            ("phi", &self.phi),
            ("theta", &self.theta),
            ("acpc_transform", &self.acpc_transform),
        ] {
            if let Some(file) = file.as_deref().filter(|p| !p.as_os_str().is_empty()) {
                values.push((port, path(file)));
            }
        }
        if let Some(posteriors) = &self.posteriors {
            let map = posteriors
                .iter()
                .map(|(name, file)| (name.clone(), path(file)))
                .collect::<serde_json::Map<_, _>>();
            values.push(("posteriors", Value::Object(map)));
        }
        values
    }

    /// Directory component separating this session's work from others
    pub fn work_dir_name(&self) -> String {
        format!("{}_{}", self.subject_id, self.session_id)
    }
}

/// Supplies the subjects of a batch
pub trait SubjectSource {
    fn subjects(&self) -> Result<Box<dyn Iterator<Item = Result<SubjectRecord>> + Send + '_>>;
}

impl SubjectSource for Vec<SubjectRecord> {
    fn subjects(&self) -> Result<Box<dyn Iterator<Item = Result<SubjectRecord>> + Send + '_>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}

/// Subject list in a CSV file with one column per [`SubjectRecord`] field.
/// An empty `t2_file` cell means no T2 image.
#[derive(Debug, Clone)]
pub struct CsvSubjectSource {
    path: PathBuf,
}

impl CsvSubjectSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn read_subjects_from<R: Read>(reader: R) -> Result<Vec<SubjectRecord>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut subjects = Vec::new();
    for record in reader.deserialize::<SubjectRecord>() {
        let mut record = record?;
        if record.t2_file.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            record.t2_file = None;
        }
        subjects.push(record);
    }
    Ok(subjects)
}

impl SubjectSource for CsvSubjectSource {
    fn subjects(&self) -> Result<Box<dyn Iterator<Item = Result<SubjectRecord>> + Send + '_>> {
        let file = std::fs::File::open(&self.path)
            .map_err(|e| LogisError::io(format!("open subject list {}", self.path.display()), e))?;
        let subjects = read_subjects_from(file)?;
        Ok(Box::new(subjects.into_iter().map(Ok)))
    }
}

/// Result of one subject in a batch
#[derive(Debug)]
pub struct SubjectRun {
    pub subject: SubjectRecord,
    pub outcome: Result<ExecutionReport>,
}

impl SubjectRun {
    pub fn success(&self) -> bool {
        self.outcome.as_ref().is_ok_and(ExecutionReport::success)
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub runs: Vec<SubjectRun>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|run| run.success()).count()
    }

    pub fn failed(&self) -> Vec<&SubjectRun> {
        self.runs.iter().filter(|run| !run.success()).collect()
    }
}

/// Assembles and runs one workflow per subject, one subject at a time. Each
/// subject gets its own work directory under the executor's base directory.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    config: PipelineConfig,
    executor: LocalExecutor,
}

impl BatchRunner {
    pub fn new(config: PipelineConfig, executor: LocalExecutor) -> Self {
        Self { config, executor }
    }

    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let executor = LocalExecutor::from_config(&config.execution)?;
        Ok(Self::new(config, executor))
    }

    /// The pipeline with `subject`'s boundary inputs bound as literals.
    /// With `maclearn` configured the subject must also supply every
    /// required edge-probability input.
    pub fn assemble(&self, subject: &SubjectRecord) -> Result<Workflow> {
        let mut workflow = create_logb_workflow(&self.config)?;
        for (port, value) in subject.input_values() {
            workflow.set_input(INPUTS, port, value)?;
        }
        if self.config.maclearn.is_some() {
            for (port, value) in subject.edge_probability_values() {
                workflow.set_input(ML_INPUTS, port, value)?;
            }
            check_edge_probability_inputs(&workflow, &self.config)?;
        }
        Ok(workflow)
    }

    pub async fn run_subject(&self, subject: &SubjectRecord) -> Result<ExecutionReport> {
        let workflow = self.assemble(subject)?;
        let executor = self
            .executor
            .clone()
            .with_base_dir(self.executor.base_dir().join(subject.work_dir_name()));
        executor.run(&workflow).await
    }

    /// Run every subject of `source`. A subject that fails to assemble or
    /// run is recorded and the batch moves on; a source that cannot be read
    /// ends the batch.
    pub async fn run_all<S: SubjectSource + ?Sized>(&self, source: &S) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for subject in source.subjects()? {
            let subject = subject?;
            info!("Processing subject {} session {}", subject.subject_id, subject.session_id);
            let outcome = self.run_subject(&subject).await;
            match &outcome {
                Ok(run) if run.success() => {}
                Ok(run) => warn!(
                    "{}: {} node(s) failed",
                    subject.work_dir_name(),
                    run.with_status(crate::dag_flow::NodeStatus::Failed).len()
                ),
                Err(err) => error!("{}: {}", subject.work_dir_name(), err),
            }
            report.runs.push(SubjectRun { subject, outcome });
        }
        info!("Batch finished: {}/{} subject(s) succeeded", report.succeeded(), report.runs.len());
        Ok(report)
    }
}
