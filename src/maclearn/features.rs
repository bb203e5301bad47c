//! Per-voxel feature extraction for edge classification.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::{Array3, Zip};
use tracing::debug;

use super::filters;
use super::table::FeatureTable;
use super::volume::Volume;
use crate::core::errors::{LogisError, Result};

pub const GAUSSIAN_GRADIENT_SIGMAS: [f64; 4] = [0.5, 1.0, 1.5, 2.0];

/// Width of the Gaussian used for the smoothed channels
pub const SMOOTHING_SIGMA: f64 = 1.0;

const DIRECTIONAL: [&str; 6] = ["GradX", "GradY", "GradZ", "Eigen1", "Eigen2", "Eigen3"];

/// Built-in channel suffixes in output order; the intensity channel has an
/// empty suffix.
pub fn builtin_suffixes() -> Vec<String> {
    let mut suffixes: Vec<String> = [
        "",
        "Smoothed",
        "GradMag",
        "GradMag2",
        "Laplacian",
        "LapGauss",
        "Sobel",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    suffixes.extend(
        GAUSSIAN_GRADIENT_SIGMAS
            .iter()
            .map(|sigma| format!("GaussGrad_{sigma:.1}").replace('.', "_")),
    );
    suffixes.extend(DIRECTIONAL.iter().map(|name| name.to_string()));
    suffixes.extend(DIRECTIONAL.iter().map(|name| format!("Gauss_{name}")));
    suffixes
}

pub fn builtin_feature_names(modality: &str) -> Vec<String> {
    builtin_suffixes()
        .into_iter()
        .map(|suffix| format!("{modality}{suffix}"))
        .collect()
}

/// Read a JSON list of channel names
pub fn read_feature_order<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| LogisError::io(format!("read feature order {}", path.display()), e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Names from `feature_order` that are not built-in channels of any of
/// `modalities`, in file order
pub fn auxiliary_names<S: AsRef<str>>(feature_order: &[String], modalities: &[S]) -> Vec<String> {
    let builtin: Vec<String> = modalities
        .iter()
        .flat_map(|m| builtin_feature_names(m.as_ref()))
        .collect();
    feature_order
        .iter()
        .filter(|name| !builtin.contains(name))
        .cloned()
        .collect()
}

/// Open the auxiliary channel for every name, in order
pub fn load_auxiliary(
    names: &[String],
    files: &BTreeMap<String, PathBuf>,
) -> Result<Vec<(String, Volume)>> {
    names
        .iter()
        .map(|name| {
            let path = files.get(name).ok_or_else(|| {
                LogisError::configuration_field(
                    format!("no image supplied for auxiliary feature '{name}'"),
                    name.clone(),
                )
            })?;
            Ok((name.clone(), Volume::open(path)?))
        })
        .collect()
}

fn linear(data: Array3<f32>) -> Vec<f32> {
    if data.is_standard_layout() {
        data.into_raw_vec()
    } else {
        data.iter().copied().collect()
    }
}

fn directional_channels(data: &Array3<f32>, spacing: [f64; 3]) -> Vec<Array3<f32>> {
    let [gx, gy, gz] = filters::gradient(data, spacing);
    let [e1, e2, e3] = filters::hessian_eigenvalues(data, spacing);
    vec![gx.mapv(f32::abs), gy.mapv(f32::abs), gz.mapv(f32::abs), e1, e2, e3]
}

fn builtin_channels(image: &Volume) -> Vec<Array3<f32>> {
    let data = image.data();
    let spacing = image.spacing();
    let smoothed = filters::gaussian_smooth(data, spacing, SMOOTHING_SIGMA);
    let grad_mag = filters::gradient_magnitude(data, spacing);

    let mut channels = vec![
        data.clone(),
        smoothed.clone(),
        filters::gradient_magnitude(&grad_mag, spacing),
        filters::laplacian(data, spacing),
        filters::laplacian_of_gaussian(data, spacing, SMOOTHING_SIGMA),
        filters::sobel_magnitude(data),
    ];
    channels.insert(2, grad_mag);
    channels.extend(
        GAUSSIAN_GRADIENT_SIGMAS
            .iter()
            .map(|&sigma| filters::gaussian_gradient_magnitude(data, spacing, sigma)),
    );
    channels.extend(directional_channels(data, spacing));
    channels.extend(directional_channels(&smoothed, spacing));
    channels
}

/// Feature table for one image.
///
/// Built-in channels are named `{modality}{suffix}` (see
/// [`builtin_suffixes`]) and, when `brain_labels` is given, zeroed outside
/// the brain region of that label volume. Auxiliary channels follow in the
/// order given, unmasked.
pub fn extract_features(
    image: &Volume,
    modality: &str,
    auxiliary: &[(String, Volume)],
    brain_labels: Option<&Volume>,
) -> Result<FeatureTable> {
    for (name, volume) in auxiliary {
        if !volume.same_grid(image) {
            return Err(LogisError::alignment(
                format!("auxiliary channel '{name}' is not on the {modality} grid"),
                image.len(),
                volume.len(),
            ));
        }
    }
    let mask = match brain_labels {
        Some(labels) if !labels.same_grid(image) => {
            return Err(LogisError::alignment(
                format!("brain label volume is not on the {modality} grid"),
                image.len(),
                labels.len(),
            ));
        }
        Some(labels) => Some(filters::brain_mask(labels.data())),
        None => None,
    };

    debug!(modality, auxiliary = auxiliary.len(), masked = mask.is_some(), "extracting features");
    let mut table = FeatureTable::new(image.len());
    for (suffix, mut channel) in builtin_suffixes().into_iter().zip(builtin_channels(image)) {
        if let Some(mask) = &mask {
            Zip::from(&mut channel)
                .and(mask)
                .for_each(|value, &inside| {
                    if !inside {
                        *value = 0.0;
                    }
                });
        }
        table.push_feature(format!("{modality}{suffix}"), linear(channel))?;
    }
    for (name, volume) in auxiliary {
        table.push_feature(name.clone(), volume.linear().into_owned())?;
    }
    Ok(table)
}

/// Built-in channels of every modality side by side, then the auxiliary
/// channels once
pub fn multimodal_features(
    images: &[(String, Volume)],
    auxiliary: &[(String, Volume)],
    brain_labels: Option<&Volume>,
) -> Result<FeatureTable> {
    let tables = images
        .iter()
        .enumerate()
        .map(|(i, (modality, image))| {
            let aux = if i + 1 == images.len() { auxiliary } else { &[] };
            extract_features(image, modality, aux, brain_labels)
        })
        .collect::<Result<Vec<_>>>()?;
    FeatureTable::concat_columns(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn blob() -> Volume {
        let data = Array3::from_shape_fn((5, 6, 7), |(z, y, x)| {
            let d = (z as f32 - 2.0).powi(2) + (y as f32 - 3.0).powi(2) + (x as f32 - 3.0).powi(2);
            100.0 * (-d / 4.0).exp()
        });
        Volume::from_array(data, [1.0, 1.0, 1.5])
    }

    #[test]
    fn test_builtin_names() {
        let names = builtin_feature_names("T1");
        assert_eq!(names.len(), 23);
        assert_eq!(&names[..3], &["T1", "T1Smoothed", "T1GradMag"]);
        assert!(names.contains(&"T1GaussGrad_0_5".to_string()));
        assert!(names.contains(&"T1GaussGrad_2_0".to_string()));
        assert_eq!(names.last().unwrap(), "T1Gauss_Eigen3");
    }

    #[test]
    fn test_extract_features_is_deterministic() {
        let image = blob();
        let first = extract_features(&image, "T1", &[], None).unwrap();
        let second = extract_features(&image, "T1", &[], None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.rows(), image.len());
        assert_eq!(first.feature_names(), builtin_feature_names("T1"));
        assert_eq!(first.feature("T1").unwrap(), &image.linear()[..]);
    }

    #[test]
    fn test_auxiliary_order_and_grid() {
        let image = blob();
        let aux = vec![
            ("ThicknessA".to_string(), image.map(|_| 1.0)),
            ("Posterior".to_string(), image.map(|_| 2.0)),
        ];
        let table = extract_features(&image, "T2", &aux, None).unwrap();
        let names = table.feature_names();
        assert_eq!(&names[names.len() - 2..], &["ThicknessA", "Posterior"]);

        let small = Volume::from_array(Array3::zeros((1, 1, 1)), [1.0; 3]);
        let err = extract_features(&image, "T2", &[("bad".to_string(), small)], None).unwrap_err();
        assert_eq!(err.category(), "data_alignment");
    }

    #[test]
    fn test_brain_mask_zeroes_builtin_channels() {
        let image = blob();
        let labels = image.map(|_| 0.0);
        let aux = vec![("Posterior".to_string(), image.map(|_| 2.0))];
        let table = extract_features(&image, "T1", &aux, Some(&labels)).unwrap();
        assert!(table.feature("T1").unwrap().iter().all(|v| *v == 0.0));
        assert!(table.feature("Posterior").unwrap().iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_auxiliary_names_drop_builtins() {
        let order = vec![
            "T1".to_string(),
            "T1GradMag".to_string(),
            "CSFPosterior".to_string(),
            "T2Sobel".to_string(),
        ];
        assert_eq!(auxiliary_names(&order, &["T1", "T2"]), vec!["CSFPosterior"]);
        assert_eq!(
            auxiliary_names(&order, &["T1"]),
            vec!["CSFPosterior", "T2Sobel"]
        );
    }

    #[test]
    fn test_missing_auxiliary_file() {
        let err = load_auxiliary(&["CSFPosterior".to_string()], &BTreeMap::new()).unwrap_err();
        assert!(err.is_assembly_error());
    }
}
