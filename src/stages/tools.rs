//! External tool stages.
//!
//! A [`ToolSpec`] describes how a command-line tool maps ports and parameters
//! onto its arguments. [`CommandStage`] runs it inside the node's work
//! directory and reports the files it promised to produce.
//!
//! Argument order is: every parameter as `--key value` (booleans as a bare
//! flag when true), then inputs in declaration order, then outputs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::action::{value_to_arg, StageCtx, StageInterface};
use crate::core::errors::LogisError;
use crate::dag_flow::{PortKind, PortSpec, PortValues};

/// How a value is placed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgStyle {
    Flag(String),
    Positional,
    /// Used for filename templates only, never passed to the tool
    Hidden,
}

impl From<Option<&str>> for ArgStyle {
    fn from(flag: Option<&str>) -> Self {
        match flag {
            Some(flag) => ArgStyle::Flag(flag.to_string()),
            None => ArgStyle::Positional,
        }
    }
}

/// Where an output file's name comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFile {
    Fixed(String),
    /// `{key}` placeholders filled from inputs, then parameters
    Template(String),
    /// Filename supplied on an input port, with an optional fallback
    FromInput {
        port: String,
        default: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub port: PortSpec,
    pub file: OutputFile,
    pub style: ArgStyle,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub interface: String,
    pub executable: String,
    pub inputs: Vec<(PortSpec, ArgStyle)>,
    pub outputs: Vec<ToolOutput>,
}

impl ToolSpec {
    pub fn new(interface: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            executable: executable.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, port: PortSpec, flag: Option<&str>) -> Self {
        self.inputs.push((port, flag.into()));
        self
    }

    pub fn hidden_input(mut self, port: PortSpec) -> Self {
        self.inputs.push((port, ArgStyle::Hidden));
        self
    }

    pub fn fixed_output(mut self, port: PortSpec, file_name: &str, flag: Option<&str>) -> Self {
        self.outputs.push(ToolOutput {
            port,
            file: OutputFile::Fixed(file_name.to_string()),
            style: flag.into(),
        });
        self
    }

    /// Output whose tool-side name is implied; not passed on the command line
    pub fn implied_output(mut self, port: PortSpec, template: &str) -> Self {
        self.outputs.push(ToolOutput {
            port,
            file: OutputFile::Template(template.to_string()),
            style: ArgStyle::Hidden,
        });
        self
    }

    pub fn template_output(mut self, port: PortSpec, template: &str, flag: Option<&str>) -> Self {
        self.outputs.push(ToolOutput {
            port,
            file: OutputFile::Template(template.to_string()),
            style: flag.into(),
        });
        self
    }

    /// Output named by the value on input port `name_port`. The name port is
    /// declared as an input; it is optional when a default exists.
    pub fn named_output(
        mut self,
        port: PortSpec,
        name_port: &str,
        default: Option<&str>,
        flag: Option<&str>,
    ) -> Self {
        let mut name_spec = PortSpec::value(name_port);
        name_spec.optional = default.is_some();
        self.inputs.push((name_spec, ArgStyle::Hidden));
        self.outputs.push(ToolOutput {
            port,
            file: OutputFile::FromInput {
                port: name_port.to_string(),
                default: default.map(str::to_string),
            },
            style: flag.into(),
        });
        self
    }

    /// Resolve output paths against the context's work directory
    pub fn output_paths(&self, ctx: &StageCtx) -> anyhow::Result<Vec<(String, PathBuf)>> {
        self.outputs
            .iter()
            .map(|output| {
                let name = match &output.file {
                    OutputFile::Fixed(name) => name.clone(),
                    OutputFile::Template(template) => render_template(template, ctx)?,
                    OutputFile::FromInput { port, default } => {
                        match ctx.get_input_opt::<String>(port)? {
                            Some(name) => name,
                            None => default.clone().ok_or_else(|| {
                                anyhow!("no filename supplied on input '{}'", port)
                            })?,
                        }
                    }
                };
                Ok((output.port.name.clone(), ctx.output_path(name)))
            })
            .collect()
    }

    /// Build the argument vector for one invocation
    pub fn render_args(&self, ctx: &StageCtx) -> anyhow::Result<Vec<String>> {
        let mut args = Vec::new();

        for (key, value) in &ctx.params {
            match value {
                Value::Bool(true) => args.push(format!("--{key}")),
                Value::Bool(false) | Value::Null => {}
                Value::Object(_) => warn!("{}: ignoring structured parameter '{}'", ctx.node_name, key),
                other => {
                    if let Some(rendered) = value_to_arg(other) {
                        args.push(format!("--{key}"));
                        args.push(rendered);
                    }
                }
            }
        }

        for (port, style) in &self.inputs {
            let Some(value) = ctx.inputs.get(&port.name) else {
                continue;
            };
            match (style, value) {
                (ArgStyle::Hidden, _) | (_, Value::Null) | (_, Value::Bool(false)) => {}
                (ArgStyle::Flag(flag), Value::Bool(true)) => args.push(flag.clone()),
                (ArgStyle::Flag(flag), other) => {
                    if let Some(rendered) = value_to_arg(other) {
                        args.push(flag.clone());
                        args.push(rendered);
                    }
                }
                (ArgStyle::Positional, other) => args.extend(value_to_arg(other)),
            }
        }

        for (output, (_, path)) in self.outputs.iter().zip(self.output_paths(ctx)?) {
            let path = path.to_string_lossy().into_owned();
            match &output.style {
                ArgStyle::Flag(flag) => {
                    args.push(flag.clone());
                    args.push(path);
                }
                ArgStyle::Positional => args.push(path),
                ArgStyle::Hidden => {}
            }
        }
        Ok(args)
    }
}

/// Fill `{key}` placeholders from inputs, then parameters
pub fn render_template(template: &str, ctx: &StageCtx) -> anyhow::Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let end = tail
            .find('}')
            .ok_or_else(|| anyhow!("unterminated placeholder in '{}'", template))?;
        let key = &tail[..end];
        let value = ctx
            .inputs
            .get(key)
            .or_else(|| ctx.params.get(key))
            .and_then(value_to_arg)
            .ok_or_else(|| anyhow!("no value for '{{{}}}' in '{}'", key, template))?;
        rendered.push_str(&value);
        rest = &tail[end + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

/// Runs an external tool described by a [`ToolSpec`]
#[derive(Debug, Clone)]
pub struct CommandStage {
    spec: ToolSpec,
}

impl CommandStage {
    pub fn new(spec: ToolSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }
}

#[async_trait]
impl StageInterface for CommandStage {
    fn interface_name(&self) -> &str {
        &self.spec.interface
    }

    fn input_spec(&self) -> Vec<PortSpec> {
        self.spec.inputs.iter().map(|(port, _)| port.clone()).collect()
    }

    fn output_spec(&self) -> Vec<PortSpec> {
        self.spec.outputs.iter().map(|o| o.port.clone()).collect()
    }

    async fn run(&self, ctx: &StageCtx) -> anyhow::Result<PortValues> {
        tokio::fs::create_dir_all(&ctx.work_dir)
            .await
            .with_context(|| format!("creating work directory {}", ctx.work_dir.display()))?;

        let args = self.spec.render_args(ctx)?;
        let command_line = format!("{} {}", self.spec.executable, args.join(" "));
        debug!("{}: {}", ctx.node_name, command_line);
        tokio::fs::write(ctx.work_dir.join("command.txt"), &command_line).await?;

        let child = Command::new(&self.spec.executable)
            .args(&args)
            .current_dir(&ctx.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LogisError::stage(
                    ctx.node_name.clone(),
                    format!("cannot spawn '{}': {}", self.spec.executable, e),
                )
            })?;

        let output = match ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    LogisError::timeout(
                        format!("{} ({})", ctx.node_name, self.spec.executable),
                        limit.as_millis() as u64,
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        tokio::fs::write(ctx.work_dir.join("stdout.txt"), &output.stdout).await?;
        tokio::fs::write(ctx.work_dir.join("stderr.txt"), &output.stderr).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(LogisError::stage_exit(
                ctx.node_name.clone(),
                format!("{} exited with {}: {}", self.spec.executable, output.status, last_line),
                output.status.code(),
            )
            .into());
        }

        let mut produced = PortValues::new();
        for (port, path) in self.spec.output_paths(ctx)? {
            produced.insert(port, Value::String(path.to_string_lossy().into_owned()));
        }
        info!("{}: {} finished", ctx.node_name, self.spec.interface);
        Ok(produced)
    }
}

/// Whether every file-valued entry in `value` exists on disk
pub fn missing_files(kind: PortKind, value: &Value) -> Vec<PathBuf> {
    let candidates: Vec<&Value> = match (kind, value) {
        (PortKind::File, v @ Value::String(_)) => vec![v],
        (PortKind::FileList, Value::Array(items)) => items.iter().collect(),
        (PortKind::FileMap, Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter_map(Value::as_str)
        .map(PathBuf::from)
        .filter(|path| !Path::new(path).exists())
        .collect()
}

pub fn genus_zero_image_filter() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("GenusZeroImageFilter", "GenusZeroImageFilter")
            .input(PortSpec::file("in_file"), Some("--inputVolume"))
            .named_output(PortSpec::file("out_file"), "out_mask", None, Some("--outputVolume")),
    )
}

pub fn brains_surface_generation() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("BRAINSSurfaceGeneration", "BRAINSSurfaceGeneration")
            .input(PortSpec::file("in_file"), Some("--inputImageFile"))
            .named_output(PortSpec::file("out_file"), "out_file", None, Some("--outputSurface")),
    )
}

pub fn logismosb() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("LOGISMOSB", "LOGISMOSB")
            .input(PortSpec::file("t1_file"), Some("--inputT1"))
            .input(PortSpec::file("t2_file").optional(), Some("--inputT2"))
            .input(PortSpec::file("wm_file"), Some("--inputWMFile"))
            .input(PortSpec::file("mesh_file"), Some("--inputMeshFile"))
            .input(PortSpec::file("brainlabels_file"), Some("--inputABCLabelsFile"))
            .input(PortSpec::file("atlas_file").optional(), Some("--inputHNCMAFile"))
            .input(PortSpec::file("gm_proba_file").optional(), Some("--inputGMProbabilityFile"))
            .input(PortSpec::value("basename"), Some("--outputBase"))
            .implied_output(PortSpec::file("gmsurface_file"), "{basename}_gmsurface.vtk")
            .implied_output(PortSpec::file("wmsurface_file"), "{basename}_wmsurface.vtk")
            .implied_output(
                PortSpec::file("profile_file").optional(),
                "{basename}_profile.vtk",
            ),
    )
}

/// White-matter masking; the tool always writes both hemispheres
pub fn wm_masking() -> CommandStage {
    let mut spec = ToolSpec::new("WMMasking", "WMMasking")
        .input(PortSpec::file("csf_file"), Some("--inputCSFFile"))
        .input(PortSpec::file("atlas_file"), Some("--inputAtlasFile"))
        .input(PortSpec::file("brainlabels_file"), Some("--inputBrainLabelsFile"));
    for hemisphere in ["lh", "rh"] {
        spec = spec
            .implied_output(
                PortSpec::file(format!("{hemisphere}_wm")),
                &format!("{hemisphere}_wm.nii.gz"),
            )
            .implied_output(
                PortSpec::file(format!("{hemisphere}_boundary")),
                &format!("{hemisphere}_boundary.nii.gz"),
            );
    }
    CommandStage::new(spec)
}

pub fn create_gm_label_map() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("CreateGMLabelMap", "CreateGMLabelMap")
            .input(PortSpec::file("atlas_file"), Some("--inputAtlasFile"))
            .fixed_output(PortSpec::file("out_file"), "gm_labels.nii.gz", Some("--outputVolume")),
    )
}

pub fn compute_distance() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("ComputeDistance", "ComputeDistance")
            .input(PortSpec::file("gm_file"), Some("--inputGMSurface"))
            .input(PortSpec::file("wm_file"), Some("--inputWMSurface"))
            .input(PortSpec::file("labels_file").optional(), Some("--inputLabels"))
            .input(PortSpec::value("hemisphere"), Some("--hemisphere"))
            .template_output(
                PortSpec::file("out_file"),
                "{hemisphere}_thickness.vtk",
                Some("--outputSurface"),
            ),
    )
}

pub fn brains_resample() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("BRAINSResample", "BRAINSResample")
            .input(PortSpec::file("inputVolume"), Some("--inputVolume"))
            .input(PortSpec::file("referenceVolume"), Some("--referenceVolume"))
            .input(PortSpec::file("warpTransform").optional(), Some("--warpTransform"))
            .named_output(
                PortSpec::file("outputVolume"),
                "outputVolume",
                Some("resampled.nii.gz"),
                Some("--outputVolume"),
            ),
    )
}

pub fn mri_convert() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("MRIConvert", "mri_convert")
            .input(PortSpec::file("in_file"), None)
            .named_output(PortSpec::file("out_file"), "out_file", Some("converted.nii.gz"), None),
    )
}

pub fn mris_convert() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("MRIsConvert", "mris_convert")
            .input(PortSpec::file("in_file"), None)
            .named_output(PortSpec::file("converted"), "out_file", Some("converted.vtk"), None),
    )
}

pub fn surface_mask() -> CommandStage {
    CommandStage::new(
        ToolSpec::new("SurfaceMask", "mri_surfacemask")
            .input(PortSpec::file("in_volume"), None)
            .input(PortSpec::file("in_surface"), None)
            .named_output(PortSpec::file("out_file"), "out_file", Some("surface_mask.nii.gz"), None),
    )
}
