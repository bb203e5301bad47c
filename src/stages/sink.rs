//! Data sink: copies selected stage outputs into the results tree.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::action::{InputOrigin, StageCtx, StageInterface};
use crate::dag_flow::{PortSpec, PortValues};

/// Ordered `(from, to)` text replacements applied to sink destinations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSubstitutions(Vec<(String, String)>);

impl SinkSubstitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.0.push((from.into(), to.into()));
    }

    /// Drop `_<axis>_<value>` for every axis value and
    /// `_baw_dir_<dir with '/' as '..'>` for every source directory
    pub fn for_pipeline<V, D>(axis: &str, axis_values: &[V], source_dirs: &[D]) -> Self
    where
        V: AsRef<str>,
        D: AsRef<str>,
    {
        let mut substitutions = Self::new();
        for value in axis_values {
            substitutions.push(format!("_{}_{}", axis, value.as_ref()), "");
        }
        for dir in source_dirs {
            substitutions.push(format!("_baw_dir_{}", dir.as_ref().replace('/', "..")), "");
        }
        substitutions
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn apply(&self, path: &str) -> String {
        self.0
            .iter()
            .fold(path.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
    }
}

#[derive(Debug, Clone)]
pub struct DataSink {
    slots: Vec<String>,
    substitutions: SinkSubstitutions,
}

impl DataSink {
    /// `slots` are container paths such as `LOGISMOSB` or `LOGISMOSB.@a`
    pub fn new<I, S>(slots: I, substitutions: SinkSubstitutions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slots: slots.into_iter().map(Into::into).collect(),
            substitutions,
        }
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    /// Where `file_name` arriving on `slot` is copied to
    pub fn destination(
        &self,
        base: &Path,
        slot: &str,
        origin: Option<&InputOrigin>,
        file_name: &str,
    ) -> PathBuf {
        let mut relative: Vec<String> = slot
            .split('.')
            .filter(|part| !part.starts_with('@'))
            .map(str::to_string)
            .collect();
        if let Some(axis) = origin.and_then(|o| o.axis.as_ref()) {
            relative.push(axis.iterable_dir());
        }
        relative.push(file_name.to_string());

        let substituted = self.substitutions.apply(&relative.join("/"));
        substituted
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(base.to_path_buf(), |acc, part| acc.join(part))
    }
}

fn file_candidates(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl StageInterface for DataSink {
    fn interface_name(&self) -> &str {
        "DataSink"
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        let mut ports = vec![PortSpec::value("base_directory")];
        ports.extend(self.slots.iter().map(|slot| PortSpec::value(slot).optional()));
        ports
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        vec![PortSpec::value("out_file").optional()]
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        let base: PathBuf = ctx.get_input("base_directory")?;
        let mut copied = Vec::new();

        for slot in &self.slots {
            let Some(value) = ctx.inputs.get(slot) else {
                continue;
            };
            for candidate in file_candidates(value) {
                let source = Path::new(candidate);
                if !source.is_file() {
                    warn!("{}: '{}' on {} is not a file, skipping", ctx.node_name, candidate, slot);
                    continue;
                }
                let file_name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let dest = self.destination(&base, slot, ctx.origins.get(slot), &file_name);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(source, &dest)
                    .await
                    .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
                debug!("{}: {} -> {}", ctx.node_name, source.display(), dest.display());
                copied.push(Value::String(dest.to_string_lossy().into_owned()));
            }
            if matches!(value, Value::Bool(_) | Value::Number(_) | Value::Object(_)) {
                warn!("{}: non-file value on {} not persisted", ctx.node_name, slot);
            }
        }

        Ok(PortValues::from([("out_file".to_string(), Value::Array(copied))]))
    }
}
