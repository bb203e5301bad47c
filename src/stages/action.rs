//! Stage interface - the unit of work behind a stage node
//!
//! Stages are compute-only: they receive their bound inputs and parameters
//! through a [`StageCtx`] and return output values. Everything that crosses
//! a connection is a JSON value, usually a file path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;

use crate::dag_flow::{AxisBinding, ParamRecord, PortSpec, PortValues};

#[async_trait]
pub trait StageInterface: DynClone + fmt::Debug + Send + Sync {
    /// Interface type name, e.g. `GenusZeroImageFilter`
    fn interface_name(&self) -> &str;

    fn input_spec(&self) -> Vec<PortSpec>;

    fn output_spec(&self) -> Vec<PortSpec>;

    /// Run the stage. The engine has already checked that required inputs
    /// are present and that file-valued inputs exist.
    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues>;
}

dyn_clone::clone_trait_object!(StageInterface);

/// Where an input value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOrigin {
    pub node: String,
    pub port: String,
    pub axis: Option<AxisBinding>,
}

/// Context for one stage invocation
#[derive(Debug, Clone)]
pub struct StageCtx {
    /// Qualified node name
    pub node_name: String,
    /// Scratch directory owned by this node
    pub work_dir: PathBuf,
    pub inputs: PortValues,
    pub params: ParamRecord,
    pub origins: BTreeMap<String, InputOrigin>,
    /// Pass-through limit for external processes
    pub timeout: Option<Duration>,
}

impl StageCtx {
    pub fn new(node_name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_name: node_name.into(),
            work_dir: work_dir.into(),
            inputs: PortValues::new(),
            params: ParamRecord::new(),
            origins: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Get input value by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get optional input value
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.inputs.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }

    pub fn get_param_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.params.get(key) {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("parameter '{}' has an unexpected type", key)),
            _ => Ok(None),
        }
    }

    pub fn input_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        self.get_input::<PathBuf>(key)
    }

    /// Path for a file this stage writes, inside its work directory
    pub fn output_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        let file_name = file_name.as_ref();
        if file_name.is_absolute() {
            file_name.to_path_buf()
        } else {
            self.work_dir.join(file_name)
        }
    }
}

/// Render a JSON value as a command-line or filename fragment
pub fn value_to_arg(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_to_arg)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => None,
    }
}
