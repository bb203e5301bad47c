//! Run configuration, loaded once before graph assembly and read-only after.
//!
//! Key spellings follow the configuration files the pipeline has always
//! used (`Results_Directory`, `LOGISMOSB.nColumns`, ...). Stage parameters
//! that the orchestration layer only forwards are kept as raw JSON values:
//! their presence is checked, their meaning belongs to the external tool.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{LogisError, Result};
use crate::dag_flow::ParamRecord;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Atlas description forwarded to masking, label map and thickness stages
    pub atlas_info: String,
    /// Fan-out axis values, in order. An empty list is valid.
    pub hemisphere_names: Vec<String>,
    /// Presence enables the persistence branch
    #[serde(rename = "Results_Directory", default)]
    pub results_directory: Option<PathBuf>,
    /// Upstream directories whose iterable suffixes are stripped from sink paths
    #[serde(rename = "BAW_Directories", default)]
    pub baw_directories: Option<Vec<String>>,
    /// Also copy the raw pipeline inputs into the results tree
    #[serde(rename = "copy_BAW", default)]
    pub copy_baw: bool,
    #[serde(rename = "GenusZeroImageFilter")]
    pub genus_zero: GenusZeroParams,
    #[serde(rename = "BRAINSSurfaceGeneration")]
    pub surface_generation: SurfaceGenerationParams,
    #[serde(rename = "LOGISMOSB")]
    pub logismosb: LogismosbParams,
    #[serde(rename = "WMMasking")]
    pub wm_masking: WmMaskingParams,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Presence enables the classifier-driven edge probability branch
    #[serde(default)]
    pub maclearn: Option<MachineLearningConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenusZeroParams {
    pub connectivity: Value,
    pub biggest_component: Value,
    pub connected_component: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceGenerationParams {
    pub smooth_surface: Value,
    pub num_iterations: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogismosbParams {
    #[serde(rename = "smoothnessConstraint")]
    pub smoothness_constraint: Value,
    #[serde(rename = "nColumns")]
    pub n_columns: Value,
    #[serde(rename = "columnChoice")]
    pub column_choice: Value,
    #[serde(rename = "columnHeight")]
    pub column_height: Value,
    #[serde(rename = "nodeSpacing")]
    pub node_spacing: Value,
    pub w: Value,
    pub a: Value,
    #[serde(rename = "nPropagate")]
    pub n_propagate: Value,
    /// Derive thick regions from the HNCMA atlas labels
    #[serde(rename = "useHNCMALabels", default)]
    pub use_hncma_labels: Option<bool>,
    /// Explicit thick-region label codes
    #[serde(rename = "thickRegions", alias = "HNCMAThickRegions", default)]
    pub thick_regions: Option<Vec<i64>>,
}

/// How LOGISMOS-B learns which cortical regions are thick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThickRegionMode {
    /// Label codes listed in the configuration
    Explicit(Vec<i64>),
    /// Labels taken from the HNCMA atlas
    AtlasLabels,
}

impl LogismosbParams {
    /// Resolve the thick-region setting to exactly one mode.
    pub fn thick_region_mode(&self) -> Result<ThickRegionMode> {
        let explicit = self
            .thick_regions
            .as_ref()
            .filter(|regions| !regions.is_empty());
        let atlas = self.use_hncma_labels.unwrap_or(false);

        match (explicit, atlas) {
            (Some(regions), false) => Ok(ThickRegionMode::Explicit(regions.clone())),
            (None, true) => Ok(ThickRegionMode::AtlasLabels),
            (Some(_), true) => Err(LogisError::configuration_field(
                "thickRegions and useHNCMALabels are mutually exclusive",
                "LOGISMOSB",
            )),
            (None, false) => Err(LogisError::configuration_field(
                "either a non-empty thickRegions list or useHNCMALabels must be set",
                "LOGISMOSB",
            )),
        }
    }

    /// Parameters forwarded verbatim to the LOGISMOS-B tool
    pub fn stage_params(&self) -> Result<ParamRecord> {
        let mut params = ParamRecord::new();
        params.insert("smoothnessConstraint".into(), self.smoothness_constraint.clone());
        params.insert("nColumns".into(), self.n_columns.clone());
        params.insert("columnChoice".into(), self.column_choice.clone());
        params.insert("columnHeight".into(), self.column_height.clone());
        params.insert("nodeSpacing".into(), self.node_spacing.clone());
        params.insert("w".into(), self.w.clone());
        params.insert("a".into(), self.a.clone());
        params.insert("nPropagate".into(), self.n_propagate.clone());
        match self.thick_region_mode()? {
            ThickRegionMode::Explicit(regions) => {
                params.insert("thick_regions".into(), Value::from(regions));
            }
            ThickRegionMode::AtlasLabels => {
                params.insert("useHNCMALabels".into(), Value::Bool(true));
            }
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmMaskingParams {
    pub dilation: Value,
}

/// Settings handed through to whatever engine runs the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum number of nodes executing at once
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Maximum wait in seconds for one external process
    #[serde(default)]
    pub job_finished_timeout: Option<u64>,
    /// Root directory for node work directories
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

fn default_max_parallel_nodes() -> usize {
    4
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            job_finished_timeout: None,
            working_directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineLearningConfig {
    /// Classifier artifact used by the prediction stage
    #[serde(default)]
    pub classifier_file: Option<PathBuf>,
    /// Prefix of the probability map file
    #[serde(default = "default_edge_name")]
    pub edge_name: String,
    /// Resample feature images onto the T1 grid before predicting
    #[serde(default = "default_resample")]
    pub resample: bool,
}

fn default_edge_name() -> String {
    "gm".to_string()
}

fn default_resample() -> bool {
    true
}

impl Default for MachineLearningConfig {
    fn default() -> Self {
        Self {
            classifier_file: None,
            edge_name: default_edge_name(),
            resample: default_resample(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration file. `.json` files are parsed as JSON, anything
    /// else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LogisError::io(format!("read config {}", path.display()), e))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        tracing::debug!(
            "Loaded configuration {} ({} hemisphere(s))",
            path.display(),
            config.hemisphere_names.len()
        );
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in &self.hemisphere_names {
            if name.is_empty() {
                return Err(LogisError::configuration_field(
                    "hemisphere names cannot be empty",
                    "hemisphere_names",
                ));
            }
            // Names become node-name prefixes and port prefixes.
            if name.contains('.') || name.contains('/') {
                return Err(LogisError::configuration_field(
                    format!("hemisphere name '{name}' may not contain '.' or '/'"),
                    "hemisphere_names",
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(LogisError::configuration_field(
                    format!("hemisphere name '{name}' is listed twice"),
                    "hemisphere_names",
                ));
            }
        }

        if self.execution.max_parallel_nodes == 0 {
            return Err(LogisError::configuration_field(
                "max_parallel_nodes must be greater than 0",
                "execution.max_parallel_nodes",
            ));
        }

        if let Some(timeout) = self.execution.job_finished_timeout {
            if timeout == 0 {
                return Err(LogisError::configuration_field(
                    "job_finished_timeout must be greater than 0",
                    "execution.job_finished_timeout",
                ));
            }
        }

        self.logismosb.thick_region_mode()?;
        Ok(())
    }

    /// Results root, if the persistence branch is enabled
    pub fn results_root(&self) -> Option<&Path> {
        self.results_directory
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Configured upstream directories, skipping blanks
    pub fn source_directories(&self) -> Vec<String> {
        self.baw_directories
            .iter()
            .flatten()
            .filter(|dir| !dir.is_empty())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_YAML: &str = r#"
atlas_info: /opt/atlas/atlas_info.csv
hemisphere_names: [lh, rh]
GenusZeroImageFilter:
  connectivity: 18
  biggestComponent: true
  connectedComponent: true
BRAINSSurfaceGeneration:
  smoothSurface: true
  numIterations: 5
LOGISMOSB:
  smoothnessConstraint: 30
  nColumns: 300
  columnChoice: NORMAL
  columnHeight: 7
  nodeSpacing: 0.0625
  w: 0.5
  a: 2
  nPropagate: 5
  thickRegions: [1006, 2006]
WMMasking:
  dilation: 3
"#;

    #[test]
    fn test_load_yaml() {
        let config = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        assert_eq!(config.hemisphere_names, vec!["lh", "rh"]);
        assert!(config.results_root().is_none());
        assert!(!config.copy_baw);
        assert_eq!(config.execution.max_parallel_nodes, 4);
        assert_eq!(
            config.logismosb.thick_region_mode().unwrap(),
            ThickRegionMode::Explicit(vec![1006, 2006])
        );
    }

    #[test]
    fn test_duplicate_hemisphere_rejected() {
        let yaml = SAMPLE_YAML.replace("[lh, rh]", "[lh, lh]");
        let err = PipelineConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, LogisError::Configuration { .. }));
    }

    #[test]
    fn test_dotted_hemisphere_rejected() {
        let yaml = SAMPLE_YAML.replace("[lh, rh]", "[l.h]");
        assert!(PipelineConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_thick_region_modes() {
        let mut params = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap().logismosb;

        params.use_hncma_labels = Some(true);
        assert!(params.thick_region_mode().is_err());

        params.thick_regions = Some(Vec::new());
        assert_eq!(params.thick_region_mode().unwrap(), ThickRegionMode::AtlasLabels);
        let stage = params.stage_params().unwrap();
        assert_eq!(stage.get("useHNCMALabels"), Some(&Value::Bool(true)));
        assert!(stage.get("thick_regions").is_none());

        params.use_hncma_labels = Some(false);
        let err = params.thick_region_mode().unwrap_err();
        assert!(matches!(err, LogisError::Configuration { .. }));
    }

    #[test]
    fn test_empty_results_directory_disables_sink() {
        let yaml = format!("{SAMPLE_YAML}Results_Directory: \"\"\n");
        let config = PipelineConfig::from_yaml_str(&yaml).unwrap();
        assert!(config.results_root().is_none());
    }

    #[test]
    fn test_json_config() {
        let value: serde_yaml::Value = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        let json = serde_json::to_string(&value).unwrap();
        let config = PipelineConfig::from_json_str(&json).unwrap();
        assert_eq!(config.wm_masking.dilation, Value::from(3));
    }
}
