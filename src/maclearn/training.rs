//! Classifier training and artifact persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::classifier::{distinct_classes, Classifier, ModelFactory};
use super::table::{Matter, RegionalTable};
use crate::core::errors::{LogisError, Result};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;

/// Identifies one trained classifier: a matter and, for regional models,
/// the region label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub matter: Matter,
    pub region: Option<i64>,
}

impl ArtifactKey {
    pub fn base(matter: Matter) -> Self {
        Self { matter, region: None }
    }

    pub fn regional(matter: Matter, label: i64) -> Self {
        Self {
            matter,
            region: Some(label),
        }
    }

    /// `{Matter}BaseCLF.clf` or `{Matter}{Label}RegionalCLF.clf`
    pub fn file_name(&self) -> String {
        match self.region {
            None => format!("{}BaseCLF.clf", self.matter),
            Some(label) => format!("{}{}RegionalCLF.clf", self.matter, label),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierArtifact<M> {
    pub format_version: u32,
    pub matter: Matter,
    pub region: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub model: M,
}

impl<M: Serialize + DeserializeOwned> ClassifierArtifact<M> {
    pub fn new(key: ArtifactKey, model: M) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            matter: key.matter,
            region: key.region,
            created_at: Utc::now(),
            model,
        }
    }

    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            matter: self.matter,
            region: self.region,
        }
    }

    /// Replace `path` wholesale: the envelope is written next to it and
    /// renamed into place
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = bincode::serialize(self)?;
        let compressed = zstd::encode_all(&*serialized, COMPRESSION_LEVEL)
            .map_err(|e| LogisError::io(format!("compress classifier {}", path.display()), e))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| LogisError::io(format!("create {}", parent.display()), e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&staging, compressed)
            .map_err(|e| LogisError::io(format!("write {}", staging.display()), e))?;
        if let Err(e) = fs::rename(&staging, path) {
            let _ = fs::remove_file(&staging);
            return Err(LogisError::io(format!("replace {}", path.display()), e));
        }
        debug!("Saved classifier artifact {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let compressed = fs::read(path)
            .map_err(|e| LogisError::io(format!("read classifier {}", path.display()), e))?;
        let bytes = zstd::decode_all(&compressed[..])
            .map_err(|e| LogisError::io(format!("decompress classifier {}", path.display()), e))?;
        let artifact: Self = bincode::deserialize(&bytes)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(LogisError::configuration(format!(
                "classifier {} has format version {}, expected {}",
                path.display(),
                artifact.format_version,
                ARTIFACT_FORMAT_VERSION
            )));
        }
        Ok(artifact)
    }
}

/// A trained or reloaded model together with where it lives
#[derive(Debug, Clone)]
pub struct ModelHandle<M> {
    pub path: PathBuf,
    pub key: ArtifactKey,
    pub model: M,
    pub reused: bool,
}

/// Fit a fresh model and persist it to `output_path`, or with
/// `reuse_if_exists` load the artifact already there without retraining.
pub fn train<F: ModelFactory>(
    features: ArrayView2<'_, f32>,
    targets: &[i64],
    output_path: &Path,
    key: ArtifactKey,
    factory: &F,
    n_jobs: usize,
    reuse_if_exists: bool,
) -> Result<ModelHandle<F::Model>> {
    if reuse_if_exists && output_path.is_file() {
        info!("Found classifier {}", output_path.display());
        let artifact = ClassifierArtifact::<F::Model>::load(output_path)?;
        if artifact.key() != key {
            return Err(LogisError::configuration(format!(
                "{} holds the {} classifier, expected {}",
                output_path.display(),
                artifact.key().file_name(),
                key.file_name()
            )));
        }
        return Ok(ModelHandle {
            path: output_path.to_path_buf(),
            key: artifact.key(),
            model: artifact.model,
            reused: true,
        });
    }

    let classes = distinct_classes(targets);
    if classes.len() < 2 {
        return Err(LogisError::degenerate(output_path, classes.len()));
    }

    info!(
        rows = features.nrows(),
        columns = features.ncols(),
        "Fitting classifier {}",
        output_path.display()
    );
    let mut model = factory.create(n_jobs);
    model.fit(features, targets)?;
    let artifact = ClassifierArtifact::new(key, model);
    artifact.save(output_path)?;
    Ok(ModelHandle {
        path: output_path.to_path_buf(),
        key,
        model: artifact.model,
        reused: false,
    })
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    /// Also fit one model per matter on all rows
    pub train_base: bool,
    pub out_dir: PathBuf,
    /// Concurrent fits, at least one
    pub n_jobs: usize,
    pub reuse_if_exists: bool,
}

impl TrainingOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            train_base: false,
            out_dir: out_dir.into(),
            n_jobs: 1,
            reuse_if_exists: false,
        }
    }
}

/// Artifact paths produced by [`run_training`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainedClassifiers {
    pub base: BTreeMap<Matter, PathBuf>,
    pub regional: BTreeMap<Matter, BTreeMap<i64, PathBuf>>,
    /// Partitions whose targets held a single class
    pub degenerate: Vec<ArtifactKey>,
}

fn training_jobs(table: &RegionalTable, train_base: bool) -> Vec<ArtifactKey> {
    let mut jobs = Vec::new();
    for matter in Matter::ALL {
        if train_base {
            jobs.push(ArtifactKey::base(matter));
        }
        for label in table.region_labels(matter) {
            let populated = table
                .region(matter, label)
                .is_some_and(|members| members.iter().any(|m| *m));
            if populated {
                jobs.push(ArtifactKey::regional(matter, label));
            }
        }
    }
    jobs
}

fn fit_partition<F: ModelFactory>(
    table: &RegionalTable,
    key: ArtifactKey,
    factory: &F,
    options: &TrainingOptions,
) -> Result<Option<PathBuf>> {
    let selection = match key.region {
        Some(label) => table.region(key.matter, label),
        None => None,
    };
    let features = table.feature_matrix(selection)?;
    let targets = table.selected_targets(key.matter, selection)?;
    let path = options.out_dir.join(key.file_name());
    match train(
        features.view(),
        &targets,
        &path,
        key,
        factory,
        options.n_jobs,
        options.reuse_if_exists,
    ) {
        Ok(handle) => Ok(Some(handle.path)),
        Err(LogisError::TrainingDegenerate { classes, .. }) => {
            warn!("Skipping {}: {} distinct target class(es)", key.file_name(), classes);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Train every partition of `table`: the base model per matter when asked
/// for, then one regional model per label with member rows. Fits run on
/// blocking threads, at most `n_jobs` at a time.
pub async fn run_training<F>(
    table: Arc<RegionalTable>,
    factory: Arc<F>,
    options: TrainingOptions,
) -> Result<TrainedClassifiers>
where
    F: ModelFactory + 'static,
{
    let jobs = training_jobs(&table, options.train_base);
    info!("Training {} classifier(s) into {}", jobs.len(), options.out_dir.display());

    let semaphore = Arc::new(Semaphore::new(options.n_jobs.max(1)));
    let options = Arc::new(options);
    let mut handles = Vec::with_capacity(jobs.len());
    for key in jobs {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| LogisError::stage("run_training", e.to_string()))?;
        let table = table.clone();
        let factory = factory.clone();
        let options = options.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            (key, fit_partition(&table, key, factory.as_ref(), &options))
        }));
    }

    let mut trained = TrainedClassifiers::default();
    for joined in futures::future::join_all(handles).await {
        let (key, result) = joined.map_err(|e| LogisError::stage("run_training", e.to_string()))?;
        match (result?, key.region) {
            (Some(path), None) => {
                trained.base.insert(key.matter, path);
            }
            (Some(path), Some(label)) => {
                trained
                    .regional
                    .entry(key.matter)
                    .or_default()
                    .insert(label, path);
            }
            (None, _) => trained.degenerate.push(key),
        }
    }
    Ok(trained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maclearn::classifier::{GaussianNb, GaussianNbFactory};
    use ndarray::array;

    #[test]
    fn test_artifact_file_names() {
        assert_eq!(ArtifactKey::base(Matter::WM).file_name(), "WMBaseCLF.clf");
        assert_eq!(
            ArtifactKey::regional(Matter::GM, 42).file_name(),
            "GM42RegionalCLF.clf"
        );
    }

    #[test]
    fn test_train_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GMBaseCLF.clf");
        let features = array![[0.0f32], [0.1], [3.0], [3.1]];
        let targets = [0, 0, 1, 1];
        let key = ArtifactKey::base(Matter::GM);

        let trained = train(features.view(), &targets, &path, key, &GaussianNbFactory, 1, false).unwrap();
        assert!(!trained.reused);
        assert!(path.is_file());

        let loaded = ClassifierArtifact::<GaussianNb>::load(&path).unwrap();
        assert_eq!(loaded.key(), key);
        assert_eq!(loaded.model, trained.model);
    }

    #[test]
    fn test_single_class_is_degenerate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WMBaseCLF.clf");
        let features = array![[0.0f32], [1.0]];
        let err = train(
            features.view(),
            &[1, 1],
            &path,
            ArtifactKey::base(Matter::WM),
            &GaussianNbFactory,
            1,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, LogisError::TrainingDegenerate { classes: 1, .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_retrain_replaces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GMBaseCLF.clf");
        let key = ArtifactKey::base(Matter::GM);
        let first = array![[0.0f32], [1.0]];
        train(first.view(), &[0, 1], &path, key, &GaussianNbFactory, 1, false).unwrap();
        let second = array![[10.0f32], [20.0]];
        let retrained = train(second.view(), &[0, 1], &path, key, &GaussianNbFactory, 1, false).unwrap();

        let on_disk = ClassifierArtifact::<GaussianNb>::load(&path).unwrap();
        assert_eq!(on_disk.model, retrained.model);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_reuse_rejects_artifact_of_other_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GM1006RegionalCLF.clf");
        let features = array![[0.0f32], [1.0]];
        let stored = ArtifactKey::regional(Matter::GM, 2006);
        train(features.view(), &[0, 1], &path, stored, &GaussianNbFactory, 1, false).unwrap();
        let before = fs::read(&path).unwrap();

        let wanted = ArtifactKey::regional(Matter::GM, 1006);
        let err = train(features.view(), &[0, 1], &path, wanted, &GaussianNbFactory, 1, true).unwrap_err();
        assert!(matches!(err, LogisError::Configuration { .. }));
        assert!(err.to_string().contains("GM2006RegionalCLF.clf"));
        assert_eq!(fs::read(&path).unwrap(), before);
    }
}
