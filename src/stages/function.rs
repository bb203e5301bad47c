//! In-process function stages.
//!
//! A [`FunctionStage`] wraps a plain `fn` pointer, so it cannot capture
//! state: identical inputs always give identical outputs.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use super::action::{StageCtx, StageInterface};
use crate::dag_flow::{PortSpec, PortValues};
use crate::maclearn::volume::Volume;

pub type StageFn = fn(&StageCtx) -> anyhow::Result<PortValues>;

#[derive(Clone)]
pub struct FunctionStage {
    name: &'static str,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    func: StageFn,
}

impl FunctionStage {
    pub fn new(
        name: &'static str,
        inputs: Vec<PortSpec>,
        outputs: Vec<PortSpec>,
        func: StageFn,
    ) -> Self {
        Self {
            name,
            inputs,
            outputs,
            func,
        }
    }
}

impl fmt::Debug for FunctionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStage")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[async_trait]
impl StageInterface for FunctionStage {
    fn interface_name(&self) -> &str {
        self.name
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        self.inputs.clone()
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        self.outputs.clone()
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        let func = self.func;
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || func(&ctx))
            .await
            .context("function stage panicked")?
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn compute_base_dir(ctx: &StageCtx) -> anyhow::Result<PortValues> {
    let results_dir: PathBuf = ctx.get_input("results_dir")?;
    let subject_id: String = ctx.get_input("subject_id")?;
    let session: String = ctx.get_input("session")?;
    let base_dir = absolute(&results_dir.join(subject_id).join(session))?;
    Ok(PortValues::from([("base_dir".to_string(), path_value(&base_dir))]))
}

/// `<results_dir>/<subject_id>/<session>` as an absolute path
pub fn results_base_dir() -> FunctionStage {
    FunctionStage::new(
        "BaseDirName",
        vec![
            PortSpec::value("results_dir"),
            PortSpec::value("subject_id"),
            PortSpec::value("session"),
        ],
        vec![PortSpec::value("base_dir")],
        compute_base_dir,
    )
}

fn write_ones_image(ctx: &StageCtx) -> anyhow::Result<PortValues> {
    let in_volume = ctx.input_path("in_volume")?;
    let out_file = ctx.output_path(ctx.get_input::<String>("out_file")?);
    std::fs::create_dir_all(&ctx.work_dir)?;
    let volume = Volume::open(&in_volume)?;
    volume.map(|_| 1.0).save(&out_file)?;
    Ok(PortValues::from([("out_file".to_string(), path_value(&out_file))]))
}

/// Volume of ones on the grid of `in_volume`
pub fn ones_image() -> FunctionStage {
    FunctionStage::new(
        "CreateOnesImage",
        vec![PortSpec::file("in_volume"), PortSpec::value("out_file")],
        vec![PortSpec::file("out_file")],
        write_ones_image,
    )
}
