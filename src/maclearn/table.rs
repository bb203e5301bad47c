//! Column-grouped per-voxel tables.
//!
//! A [`FeatureTable`] keeps three column groups over the same rows:
//! `Features` (one float column per channel), `Targets` (one column per
//! matter) and `<Matter>Regions` (one membership column per label). Rows are
//! linear voxel indices; a pooled table additionally keys each row by the
//! subject it came from.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::errors::{LogisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Matter {
    WM,
    GM,
}

impl Matter {
    pub const ALL: [Matter; 2] = [Matter::WM, Matter::GM];

    pub fn as_str(&self) -> &'static str {
        match self {
            Matter::WM => "WM",
            Matter::GM => "GM",
        }
    }
}

impl fmt::Display for Matter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnGroup {
    Features,
    Targets,
    Regions(Matter),
}

impl fmt::Display for ColumnGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnGroup::Features => f.write_str("Features"),
            ColumnGroup::Targets => f.write_str("Targets"),
            ColumnGroup::Regions(matter) => write!(f, "{matter}Regions"),
        }
    }
}

/// Contiguous block of rows from one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Segment {
    subject: Option<String>,
    rows: usize,
}

/// Key of one row: the subject (for pooled tables) and its voxel index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKey<'a> {
    pub subject: Option<&'a str>,
    pub voxel: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureTable {
    segments: Vec<Segment>,
    features: Vec<(String, Vec<f32>)>,
    targets: BTreeMap<Matter, Vec<f32>>,
    regions: BTreeMap<Matter, Vec<(i64, Vec<bool>)>>,
}

/// Feature table carrying region membership and targets
pub type RegionalTable = FeatureTable;

impl FeatureTable {
    /// Empty table over `rows` voxels of a single image
    pub fn new(rows: usize) -> Self {
        Self {
            segments: vec![Segment { subject: None, rows }],
            ..Default::default()
        }
    }

    pub fn rows(&self) -> usize {
        self.segments.iter().map(|s| s.rows).sum()
    }

    fn check_rows(&self, what: &str, len: usize) -> Result<()> {
        if len != self.rows() {
            return Err(LogisError::alignment(
                format!("column '{what}' does not match the table rows"),
                self.rows(),
                len,
            ));
        }
        Ok(())
    }

    pub fn push_feature(&mut self, name: impl Into<String>, values: Vec<f32>) -> Result<()> {
        let name = name.into();
        self.check_rows(&name, values.len())?;
        if self.feature(&name).is_some() {
            return Err(LogisError::configuration(format!(
                "feature column '{name}' already exists"
            )));
        }
        self.features.push((name, values));
        Ok(())
    }

    pub fn push_targets(&mut self, matter: Matter, values: Vec<f32>) -> Result<()> {
        self.check_rows(&format!("Targets/{matter}"), values.len())?;
        self.targets.insert(matter, values);
        Ok(())
    }

    pub fn push_region(&mut self, matter: Matter, label: i64, members: Vec<bool>) -> Result<()> {
        self.check_rows(&format!("{matter}Regions/{label}"), members.len())?;
        let regions = self.regions.entry(matter).or_default();
        match regions.iter_mut().find(|(l, _)| *l == label) {
            Some(existing) => existing.1 = members,
            None => regions.push((label, members)),
        }
        Ok(())
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.features.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn feature(&self, name: &str) -> Option<&[f32]> {
        self.features
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn targets(&self, matter: Matter) -> Option<&[f32]> {
        self.targets.get(&matter).map(Vec::as_slice)
    }

    /// Targets as integer class labels
    pub fn target_classes(&self, matter: Matter) -> Option<Vec<i64>> {
        self.targets(matter)
            .map(|values| values.iter().map(|v| v.round() as i64).collect())
    }

    pub fn region_labels(&self, matter: Matter) -> Vec<i64> {
        self.regions
            .get(&matter)
            .map(|regions| regions.iter().map(|(label, _)| *label).collect())
            .unwrap_or_default()
    }

    pub fn region(&self, matter: Matter, label: i64) -> Option<&[bool]> {
        self.regions
            .get(&matter)?
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, members)| members.as_slice())
    }

    /// Column headers grouped the way they are stored
    pub fn columns(&self) -> Vec<(ColumnGroup, String)> {
        let mut columns: Vec<_> = self
            .features
            .iter()
            .map(|(name, _)| (ColumnGroup::Features, name.clone()))
            .collect();
        for (matter, regions) in &self.regions {
            columns.extend(
                regions
                    .iter()
                    .map(|(label, _)| (ColumnGroup::Regions(*matter), label.to_string())),
            );
        }
        columns.extend(
            self.targets
                .keys()
                .map(|matter| (ColumnGroup::Targets, matter.to_string())),
        );
        columns
    }

    pub fn row_key(&self, row: usize) -> Option<RowKey<'_>> {
        let mut start = 0;
        for segment in &self.segments {
            if row < start + segment.rows {
                return Some(RowKey {
                    subject: segment.subject.as_deref(),
                    voxel: row - start,
                });
            }
            start += segment.rows;
        }
        None
    }

    pub fn subjects(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| s.subject.as_deref())
            .collect()
    }

    /// Row-major `rows x features` matrix, optionally restricted to rows
    /// where `selected` is true
    pub fn feature_matrix(&self, selected: Option<&[bool]>) -> Result<Array2<f32>> {
        let rows: Vec<usize> = match selected {
            Some(mask) => {
                self.check_rows("row selection", mask.len())?;
                (0..mask.len()).filter(|&i| mask[i]).collect()
            }
            None => (0..self.rows()).collect(),
        };
        let columns = self.features.len();
        Ok(Array2::from_shape_fn((rows.len(), columns), |(r, c)| {
            self.features[c].1[rows[r]]
        }))
    }

    /// Target classes restricted to `selected` rows
    pub fn selected_targets(&self, matter: Matter, selected: Option<&[bool]>) -> Result<Vec<i64>> {
        let classes = self.target_classes(matter).ok_or_else(|| {
            LogisError::configuration(format!("table has no {matter} targets"))
        })?;
        match selected {
            Some(mask) => {
                self.check_rows("row selection", mask.len())?;
                Ok(classes
                    .into_iter()
                    .zip(mask)
                    .filter_map(|(class, keep)| keep.then_some(class))
                    .collect())
            }
            None => Ok(classes),
        }
    }

    /// Join the feature columns of tables over the same rows
    pub fn concat_columns(tables: Vec<FeatureTable>) -> Result<FeatureTable> {
        let mut tables = tables.into_iter();
        let Some(mut combined) = tables.next() else {
            return Ok(FeatureTable::new(0));
        };
        for table in tables {
            if table.segments != combined.segments {
                return Err(LogisError::alignment(
                    "tables joined column-wise must share their rows",
                    combined.rows(),
                    table.rows(),
                ));
            }
            for (name, values) in table.features {
                combined.push_feature(name, values)?;
            }
            for (matter, values) in table.targets {
                combined.push_targets(matter, values)?;
            }
            for (matter, regions) in table.regions {
                for (label, members) in regions {
                    combined.push_region(matter, label, members)?;
                }
            }
        }
        Ok(combined)
    }

    /// Stack subject tables row-wise under the compound `(subject, voxel)`
    /// key. Every table must carry the same columns in the same order.
    pub fn pool(tables: Vec<(String, FeatureTable)>) -> Result<FeatureTable> {
        let mut pooled = FeatureTable::default();
        let mut layout: Option<Vec<(ColumnGroup, String)>> = None;
        for (subject, table) in tables {
            let columns = table.columns();
            match &layout {
                Some(expected) if *expected != columns => {
                    return Err(LogisError::alignment(
                        format!("subject '{subject}' has a different column layout"),
                        expected.len(),
                        columns.len(),
                    ));
                }
                Some(_) => {}
                None => layout = Some(columns),
            }
            if pooled.subjects().contains(&subject.as_str()) {
                return Err(LogisError::configuration(format!(
                    "subject '{subject}' pooled twice"
                )));
            }

            let rows = table.rows();
            if pooled.features.is_empty() {
                pooled.features = table
                    .features
                    .iter()
                    .map(|(name, _)| (name.clone(), Vec::new()))
                    .collect();
            }
            for ((_, column), (_, values)) in pooled.features.iter_mut().zip(table.features) {
                column.extend(values);
            }
            for (matter, values) in table.targets {
                pooled.targets.entry(matter).or_default().extend(values);
            }
            for (matter, regions) in table.regions {
                let pooled_regions = pooled.regions.entry(matter).or_default();
                for (label, members) in regions {
                    match pooled_regions.iter_mut().find(|(l, _)| *l == label) {
                        Some(existing) => existing.1.extend(members),
                        None => pooled_regions.push((label, members)),
                    }
                }
            }
            pooled.segments.push(Segment {
                subject: Some(subject),
                rows,
            });
        }
        Ok(pooled)
    }
}

fn label_membership(label_map: &[f32], label: i64) -> Vec<bool> {
    label_map.iter().map(|v| v.round() as i64 == label).collect()
}

/// Attach one membership column per label per matter and the two target
/// columns. All inputs are checked against the feature rows before any
/// column is added.
pub fn split_by_region(
    features: FeatureTable,
    wm_label_map: &[f32],
    wm_labels: &[i64],
    gm_label_map: &[f32],
    gm_labels: &[i64],
    wm_targets: &[f32],
    gm_targets: &[f32],
) -> Result<RegionalTable> {
    let rows = features.rows();
    let inputs = [
        ("WMLabelmap", wm_label_map.len()),
        ("GMLabelmap", gm_label_map.len()),
        ("Targets/WM", wm_targets.len()),
        ("Targets/GM", gm_targets.len()),
    ];
    for (name, len) in inputs {
        if len != rows {
            return Err(LogisError::alignment(
                format!("{name} does not match the feature rows"),
                rows,
                len,
            ));
        }
    }

    let mut table = features;
    for &label in wm_labels {
        table.push_region(Matter::WM, label, label_membership(wm_label_map, label))?;
    }
    for &label in gm_labels {
        table.push_region(Matter::GM, label, label_membership(gm_label_map, label))?;
    }
    table.push_targets(Matter::WM, wm_targets.to_vec())?;
    table.push_targets(Matter::GM, gm_targets.to_vec())?;
    Ok(table)
}
