//! In-process stages of the edge-probability branch.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use ndarray::Array3;
use serde_json::Value;
use tracing::{debug, info};

use super::action::{StageCtx, StageInterface};
use super::tools;
use crate::core::errors::LogisError;
use crate::dag_flow::{PortSpec, PortValues};
use crate::maclearn::classifier::{Classifier, GaussianNb};
use crate::maclearn::features::{auxiliary_names, extract_features, load_auxiliary};
use crate::maclearn::training::ClassifierArtifact;
use crate::maclearn::volume::Volume;

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

/// Feature name of a file: its basename up to the first `.`
pub fn feature_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Names rho, phi, theta and every posterior by basename, resampling each
/// onto `reference_file` when constructed with `resample`
#[derive(Debug, Clone)]
pub struct CollectFeatureFiles {
    resample: bool,
}

impl CollectFeatureFiles {
    pub fn new(resample: bool) -> Self {
        Self { resample }
    }

    fn feature_files(ctx: &StageCtx) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for port in ["rho", "phi", "theta"] {
            files.push(ctx.input_path(port)?);
        }
        let posteriors: BTreeMap<String, PathBuf> =
            ctx.get_input_opt("posterior_files")?.unwrap_or_default();
        files.extend(posteriors.into_values());
        Ok(files)
    }

    async fn resample_file(
        &self,
        ctx: &StageCtx,
        name: &str,
        in_file: &Path,
    ) -> anyhow::Result<PathBuf> {
        let reference = ctx.input_path("reference_file")?;
        let out_file = ctx.output_path(in_file.file_name().context("feature file has no name")?);
        let inverse: bool = ctx.get_param_opt("inverse_transform")?.unwrap_or(true);

        let mut nested = StageCtx::new(format!("{}.{}", ctx.node_name, name), ctx.work_dir.join(format!("_{name}")))
            .with_input("inputVolume", path_value(in_file))
            .with_input("referenceVolume", path_value(&reference))
            .with_input("outputVolume", path_value(&out_file))
            .with_param("interpolationMode", "Linear")
            .with_param("pixelType", "float")
            .with_param("inverseTransform", inverse);
        if let Some(transform) = ctx.get_input_opt::<PathBuf>("transform_file")? {
            nested = nested.with_input("warpTransform", path_value(&transform));
        }
        nested.timeout = ctx.timeout;

        tools::brains_resample().run(&nested).await?;
        if !out_file.exists() {
            bail!(LogisError::stage(
                nested.node_name,
                format!("resampled feature {} was not produced", out_file.display())
            ));
        }
        Ok(out_file)
    }
}

#[async_trait]
impl StageInterface for CollectFeatureFiles {
    fn interface_name(&self) -> &str {
        "CollectFeatureFiles"
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::file("rho"),
            PortSpec::file("phi"),
            PortSpec::file("theta"),
            PortSpec::file_map("posterior_files").optional(),
            PortSpec::file("reference_file"),
            PortSpec::file("transform_file").optional(),
        ]
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        vec![PortSpec::file_map("feature_files")]
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        if self.resample {
            tokio::fs::create_dir_all(&ctx.work_dir).await?;
        }
        let mut collected = serde_json::Map::new();
        for file in Self::feature_files(ctx)? {
            let name = feature_name(&file);
            if collected.contains_key(&name) {
                bail!("two feature files share the name '{name}'");
            }
            let path = if self.resample {
                self.resample_file(ctx, &name, &file).await?
            } else {
                file
            };
            debug!("{}: feature {} -> {}", ctx.node_name, name, path.display());
            collected.insert(name, path_value(&path));
        }
        Ok(PortValues::from([(
            "feature_files".to_string(),
            Value::Object(collected),
        )]))
    }
}

/// Applies a stored classifier to the features of `t1_file`, writing the
/// edge-class probability as a volume on the T1 grid
pub struct PredictEdgeProbability<M = GaussianNb> {
    model: PhantomData<fn() -> M>,
}

impl<M> PredictEdgeProbability<M> {
    pub fn new() -> Self {
        Self { model: PhantomData }
    }
}

impl<M> Default for PredictEdgeProbability<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for PredictEdgeProbability<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for PredictEdgeProbability<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictEdgeProbability")
            .field("model", &std::any::type_name::<M>())
            .finish()
    }
}

/// Class whose probability is written out unless `edge_class` is set
pub const DEFAULT_EDGE_CLASS: i64 = 1;

impl<M> PredictEdgeProbability<M>
where
    M: Classifier + serde::de::DeserializeOwned + serde::Serialize,
{
    fn predict(ctx: &StageCtx) -> anyhow::Result<PortValues> {
        let t1 = Volume::open(ctx.input_path("t1_file")?)?;
        let files: BTreeMap<String, PathBuf> =
            ctx.get_input_opt("additional_files")?.unwrap_or_default();
        let order: Vec<String> = match ctx.get_param_opt::<Vec<String>>("feature_order")? {
            Some(order) => auxiliary_names(&order, &["T1"]),
            None => files.keys().cloned().collect(),
        };
        let auxiliary = load_auxiliary(&order, &files)?;
        let table = extract_features(&t1, "T1", &auxiliary, None)?;

        let classifier_file = ctx.input_path("classifier_file")?;
        let artifact = ClassifierArtifact::<M>::load(&classifier_file)?;
        let edge_class = ctx.get_param_opt("edge_class")?.unwrap_or(DEFAULT_EDGE_CLASS);
        let matrix = table.feature_matrix(None)?;
        let probability = artifact.model.class_probability(matrix.view(), edge_class)?;

        let [z, y, x] = t1.shape();
        let data = Array3::from_shape_vec((z, y, x), probability)?;
        let out_file = ctx.output_path(ctx.get_input::<String>("out_file")?);
        std::fs::create_dir_all(&ctx.work_dir)?;
        t1.with_data(data)?.save(&out_file)?;
        info!("{}: wrote {}", ctx.node_name, out_file.display());
        Ok(PortValues::from([("out_file".to_string(), path_value(&out_file))]))
    }
}

#[async_trait]
impl<M> StageInterface for PredictEdgeProbability<M>
where
    M: Classifier + serde::de::DeserializeOwned + serde::Serialize + 'static,
{
    fn interface_name(&self) -> &str {
        "PredictEdgeProbability"
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::file("t1_file"),
            PortSpec::file_map("additional_files").optional(),
            PortSpec::file("classifier_file"),
            PortSpec::value("out_file"),
        ]
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        vec![PortSpec::file("out_file")]
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || Self::predict(&ctx))
            .await
            .context("edge probability prediction panicked")?
    }
}

pub const REFERENCE_FILE: &str = "reference_file.nii.gz";

/// Resamples `orig_t1` onto the voxel size and extent of `baw_t1`, then
/// reorients the result to LPS
#[derive(Debug, Clone, Default)]
pub struct CreateReferenceImage;

#[async_trait]
impl StageInterface for CreateReferenceImage {
    fn interface_name(&self) -> &str {
        "CreateReferenceImage"
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        vec![PortSpec::file("baw_t1"), PortSpec::file("orig_t1")]
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        vec![PortSpec::file("reference_file")]
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        let baw_t1 = ctx.input_path("baw_t1")?;
        let orig_t1 = ctx.input_path("orig_t1")?;
        let out_file = ctx.output_path(REFERENCE_FILE);
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        let resampled_file = out_file.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let baw = Volume::open(&baw_t1)?;
            let orig = Volume::open(&orig_t1)?;
            orig.resample_linear(baw.shape(), baw.spacing())
                .save(&resampled_file)?;
            Ok(())
        })
        .await
        .context("reference resampling panicked")??;

        let mut convert = StageCtx::new(format!("{}.MRIConvert", ctx.node_name), ctx.work_dir.join("_convert"))
            .with_input("in_file", path_value(&out_file))
            .with_input("out_file", path_value(&out_file))
            .with_param("out_orientation", "LPS");
        convert.timeout = ctx.timeout;
        tools::mri_convert().run(&convert).await?;

        Ok(PortValues::from([(
            "reference_file".to_string(),
            path_value(&out_file),
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maclearn::classifier::GaussianNbFactory;
    use crate::maclearn::table::Matter;
    use crate::maclearn::training::{train, ArtifactKey};

    #[test]
    fn test_feature_name() {
        assert_eq!(feature_name(Path::new("/data/rho.nii.gz")), "rho");
        assert_eq!(feature_name(Path::new("csf_posterior.nii")), "csf_posterior");
    }

    #[tokio::test]
    async fn test_collect_without_resampling() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageCtx::new("CollectFeatureFiles", dir.path())
            .with_input("rho", "/d/rho.nii.gz")
            .with_input("phi", "/d/phi.nii.gz")
            .with_input("theta", "/d/theta.nii.gz")
            .with_input("posterior_files", serde_json::json!({"CSF": "/d/POSTERIOR_CSF.nii.gz"}))
            .with_input("reference_file", "/d/t1.nii.gz");
        let outputs = CollectFeatureFiles::new(false).run(&ctx).await.unwrap();
        assert_eq!(
            outputs["feature_files"],
            serde_json::json!({
                "rho": "/d/rho.nii.gz",
                "phi": "/d/phi.nii.gz",
                "theta": "/d/theta.nii.gz",
                "POSTERIOR_CSF": "/d/POSTERIOR_CSF.nii.gz",
            })
        );
    }

    #[tokio::test]
    async fn test_collect_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageCtx::new("CollectFeatureFiles", dir.path())
            .with_input("rho", "/a/rho.nii.gz")
            .with_input("phi", "/b/rho.nii.gz")
            .with_input("theta", "/d/theta.nii.gz")
            .with_input("reference_file", "/d/t1.nii.gz");
        assert!(CollectFeatureFiles::new(false).run(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_predict_edge_probability_writes_volume() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::from_shape_fn((3, 4, 5), |(_, _, x)| if x < 2 { 0.0 } else { 50.0 });
        let t1 = Volume::from_array(data, [1.0; 3]);
        let t1_file = dir.path().join("t1.nii.gz");
        t1.save(&t1_file).unwrap();

        let table = extract_features(&t1, "T1", &[], None).unwrap();
        let targets: Vec<i64> = t1.linear().iter().map(|v| i64::from(*v > 0.0)).collect();
        let classifier_file = dir.path().join("GMBaseCLF.clf");
        train(
            table.feature_matrix(None).unwrap().view(),
            &targets,
            &classifier_file,
            ArtifactKey::base(Matter::GM),
            &GaussianNbFactory,
            1,
            false,
        )
        .unwrap();

        let ctx = StageCtx::new("PredictEdgeProbability", dir.path().join("predict"))
            .with_input("t1_file", path_value(&t1_file))
            .with_input("classifier_file", path_value(&classifier_file))
            .with_input("out_file", "gm_edge_probability_map.nii.gz");
        let outputs = PredictEdgeProbability::<GaussianNb>::new().run(&ctx).await.unwrap();
        let out_file = PathBuf::from(outputs["out_file"].as_str().unwrap());
        let probability = Volume::open(&out_file).unwrap();
        assert_eq!(probability.shape(), [3, 4, 5]);
        assert!(probability.linear().iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
