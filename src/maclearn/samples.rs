//! Training manifests: reading, splitting and pooling labelled subjects.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::features::{auxiliary_names, load_auxiliary, multimodal_features};
use super::table::{split_by_region, FeatureTable, RegionalTable};
use super::volume::Volume;
use crate::core::errors::{LogisError, Result};

const ID: &str = "ID";
const MODALITIES: &str = "Modalities";
const GM_LABELS: &str = "GMLabels";
const WM_LABELS: &str = "WMLabels";
const GM_EDGES: &str = "GMEdges";
const WM_EDGES: &str = "WMEdges";
const WM_LABELMAP: &str = "WMLabelmap";
const GM_LABELMAP: &str = "GMLabelmap";

/// One labelled subject of a training manifest
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub id: String,
    pub modalities: Vec<String>,
    pub gm_labels: Vec<i64>,
    pub wm_labels: Vec<i64>,
    /// Image per modality
    pub images: BTreeMap<String, PathBuf>,
    pub gm_edges: PathBuf,
    pub wm_edges: PathBuf,
    pub wm_label_map: PathBuf,
    pub gm_label_map: PathBuf,
    /// Remaining columns, available as auxiliary feature channels
    pub additional: BTreeMap<String, PathBuf>,
}

/// Parse a bracketed list such as `['T1', 'T2']` or `[1, 2]`
pub fn parse_list(value: &str) -> Vec<String> {
    let inner = value
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(['\'', '"']).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_labels(value: &str, column: &str, line: usize) -> Result<Vec<i64>> {
    parse_list(value)
        .iter()
        .map(|item| {
            item.parse::<i64>().map_err(|_| {
                LogisError::configuration_field(
                    format!("manifest line {line}: '{item}' is not an integer label"),
                    column,
                )
            })
        })
        .collect()
}

fn take(row: &mut HashMap<String, String>, column: &str, line: usize) -> Result<String> {
    row.remove(column).ok_or_else(|| {
        LogisError::configuration_field(format!("manifest line {line} has no '{column}' column"), column)
    })
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<TrainingSample>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| LogisError::io(format!("open manifest {}", path.display()), e))?;
    read_manifest_from(file)
}

/// Read manifest rows. Modalities and both label lists must be identical
/// on every row.
pub fn read_manifest_from<R: Read>(reader: R) -> Result<Vec<TrainingSample>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut samples: Vec<TrainingSample> = Vec::new();
    for (index, row) in reader.deserialize::<HashMap<String, String>>().enumerate() {
        let line = index + 1;
        let mut row = row?;
        let id = take(&mut row, ID, line)?;
        let modalities = parse_list(&take(&mut row, MODALITIES, line)?);
        let gm_labels = parse_labels(&take(&mut row, GM_LABELS, line)?, GM_LABELS, line)?;
        let wm_labels = parse_labels(&take(&mut row, WM_LABELS, line)?, WM_LABELS, line)?;

        if let Some(first) = samples.first() {
            let checks = [
                (MODALITIES, first.modalities == modalities),
                (GM_LABELS, first.gm_labels == gm_labels),
                (WM_LABELS, first.wm_labels == wm_labels),
            ];
            if let Some((column, _)) = checks.into_iter().find(|(_, same)| !same) {
                return Err(LogisError::configuration_field(
                    format!("manifest line {line}: {column} must be the same for all subjects"),
                    column,
                ));
            }
        }

        let mut images = BTreeMap::new();
        for modality in &modalities {
            images.insert(modality.clone(), PathBuf::from(take(&mut row, modality, line)?));
        }
        let gm_edges = PathBuf::from(take(&mut row, GM_EDGES, line)?);
        let wm_edges = PathBuf::from(take(&mut row, WM_EDGES, line)?);
        let wm_label_map = PathBuf::from(take(&mut row, WM_LABELMAP, line)?);
        let gm_label_map = PathBuf::from(take(&mut row, GM_LABELMAP, line)?);
        let additional = row
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(column, value)| (column, PathBuf::from(value)))
            .collect();

        samples.push(TrainingSample {
            id,
            modalities,
            gm_labels,
            wm_labels,
            images,
            gm_edges,
            wm_edges,
            wm_label_map,
            gm_label_map,
            additional,
        });
    }
    debug!("Read {} training sample(s)", samples.len());
    Ok(samples)
}

/// Shuffle with `seed` and hold out `floor(n * test_fraction)` samples.
/// Returns `(train, test)`.
pub fn split_samples(
    mut samples: Vec<TrainingSample>,
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<TrainingSample>, Vec<TrainingSample>)> {
    if !(0.0..=1.0).contains(&test_fraction) {
        return Err(LogisError::configuration(format!(
            "test fraction must be between 0 and 1, got {test_fraction}"
        )));
    }
    let n_test = (samples.len() as f64 * test_fraction).floor() as usize;
    fastrand::Rng::with_seed(seed).shuffle(&mut samples);
    let test = samples.split_off(samples.len() - n_test);
    Ok((samples, test))
}

fn linear_image(path: &Path) -> Result<Vec<f32>> {
    Ok(Volume::open(path)?.linear().into_owned())
}

/// Regional table for one subject: features of every modality, the
/// auxiliary channels named in `feature_order`, then region membership
/// and edge targets.
pub fn sample_table(sample: &TrainingSample, feature_order: &[String]) -> Result<RegionalTable> {
    let images = sample
        .modalities
        .iter()
        .map(|modality| {
            let path = sample.images.get(modality).ok_or_else(|| {
                LogisError::configuration_field(
                    format!("sample '{}' has no {modality} image", sample.id),
                    modality.clone(),
                )
            })?;
            Ok((modality.clone(), Volume::open(path)?))
        })
        .collect::<Result<Vec<_>>>()?;
    let aux_names = auxiliary_names(feature_order, &sample.modalities);
    let auxiliary = load_auxiliary(&aux_names, &sample.additional)?;
    let features = multimodal_features(&images, &auxiliary, None)?;

    split_by_region(
        features,
        &linear_image(&sample.wm_label_map)?,
        &sample.wm_labels,
        &linear_image(&sample.gm_label_map)?,
        &sample.gm_labels,
        &linear_image(&sample.wm_edges)?,
        &linear_image(&sample.gm_edges)?,
    )
}

/// Pool every sample into one table keyed by `(ID, voxel)`
pub fn combine_samples(
    samples: &[TrainingSample],
    feature_order: &[String],
) -> Result<RegionalTable> {
    let tables = samples
        .iter()
        .map(|sample| {
            info!("Collecting training data for {}", sample.id);
            Ok((sample.id.clone(), sample_table(sample, feature_order)?))
        })
        .collect::<Result<Vec<_>>>()?;
    FeatureTable::pool(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = "\
ID,Modalities,GMLabels,WMLabels,T1,GMEdges,WMEdges,WMLabelmap,GMLabelmap,CSFPosterior
s1,['T1'],\"[1, 2]\",[3],/d/s1/t1.nii.gz,/d/s1/gm.nii.gz,/d/s1/wm.nii.gz,/d/s1/wml.nii.gz,/d/s1/gml.nii.gz,/d/s1/csf.nii.gz
s2,['T1'],\"[1, 2]\",[3],/d/s2/t1.nii.gz,/d/s2/gm.nii.gz,/d/s2/wm.nii.gz,/d/s2/wml.nii.gz,/d/s2/gml.nii.gz,
";

    fn samples(n: usize) -> Vec<TrainingSample> {
        let mut sample = read_manifest_from(MANIFEST.as_bytes()).unwrap().remove(0);
        (0..n)
            .map(|i| {
                sample.id = format!("s{i}");
                sample.clone()
            })
            .collect()
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("['T1', \"T2\"]"), vec!["T1", "T2"]);
        assert_eq!(parse_list("[1, 2, 3]"), vec!["1", "2", "3"]);
        assert!(parse_list("[]").is_empty());
    }

    #[test]
    fn test_read_manifest() {
        let samples = read_manifest_from(MANIFEST.as_bytes()).unwrap();
        assert_eq!(samples.len(), 2);
        let first = &samples[0];
        assert_eq!(first.modalities, vec!["T1"]);
        assert_eq!(first.gm_labels, vec![1, 2]);
        assert_eq!(first.wm_labels, vec![3]);
        assert_eq!(first.images["T1"], PathBuf::from("/d/s1/t1.nii.gz"));
        assert_eq!(first.additional["CSFPosterior"], PathBuf::from("/d/s1/csf.nii.gz"));
        assert!(samples[1].additional.is_empty());
    }

    #[test]
    fn test_manifest_labels_must_agree() {
        let manifest = MANIFEST.replacen("s2,['T1'],\"[1, 2]\"", "s2,['T1'],\"[1, 4]\"", 1);
        let err = read_manifest_from(manifest.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("GMLabels"));
    }

    #[test]
    fn test_split_is_reproducible() {
        let (train_a, test_a) = split_samples(samples(10), 0.25, 7).unwrap();
        let (train_b, test_b) = split_samples(samples(10), 0.25, 7).unwrap();
        assert_eq!(test_a.len(), 2);
        assert_eq!(train_a.len(), 8);
        assert_eq!(test_a, test_b);
        assert_eq!(train_a, train_b);

        let (train, test) = split_samples(samples(3), 0.0, 1).unwrap();
        assert_eq!((train.len(), test.len()), (3, 0));
        assert!(split_samples(samples(3), 1.5, 1).is_err());
    }
}
