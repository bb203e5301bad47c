//! Assembly of the LOGISMOS-B cortical surface workflow.
//!
//! The workflow masks white matter once, then fans out per hemisphere
//! through genus-zero correction, surface generation, LOGISMOS-B and
//! thickness computation. Persistence and the classifier-driven gray
//! matter edge probability are optional branches.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::maclearn::{create_machine_learning_workflow, EDGE_PROBABILITY_INPUTS};
use crate::core::config::{MachineLearningConfig, PipelineConfig};
use crate::core::errors::{LogisError, Result};
use crate::dag_flow::{
    axis_port_name, expand, identity, links, maybe_attach, per_axis_output_node, Connection,
    Node, NodeBuilder, NodeTemplate, PortRef, Selection, Workflow, WorkflowBuilder,
};
use crate::stages::function::results_base_dir;
use crate::stages::{tools, DataSink, SinkSubstitutions};

pub const WORKFLOW_NAME: &str = "LOGB_WF";
pub const HEMISPHERE_AXIS: &str = "hemisphere";
pub const INPUTS: &str = "Inputs";
pub const OUTPUTS: &str = "Outputs";

pub const INPUT_FIELDS: [&str; 8] = [
    "subject_id",
    "session_id",
    "t1_file",
    "t2_file",
    "csf_file",
    "fswm_atlas",
    "brainlabels_file",
    "hncma_atlas",
];

pub const OUTPUT_BASES: [&str; 2] = ["gmsurface_file", "wmsurface_file"];

/// Hemispheres the white-matter masking tool writes
pub const SUPPORTED_HEMISPHERES: [&str; 2] = ["lh", "rh"];

const WM_MASKING: &str = "WMMasking";
const GM_LABELMAP: &str = "GM_Labelmap";
const GENUS_ZERO: &str = "GenusZeroImageFilter";
const SURFACE_GENERATION: &str = "BRAINSSurfaceGeneration";
const LOGISMOSB: &str = "LOGISMOSB";
const THICKNESS: &str = "ctx_thickness";
const BASE_DIR_NAME: &str = "Base_Dir_Name";
const DATA_SINK: &str = "LOGISMOSB_DataSink";
/// Boundary node of the edge-probability branch holding per-subject inputs
pub const ML_INPUTS: &str = "MLInputs";
const EDGE_PROBABILITY: &str = "CreateEdgeProbabilityMap";

/// Per-side candidates for the hemisphere selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideCandidates<T> {
    pub lh_wm: T,
    pub rh_wm: T,
    pub lh_boundary: T,
    pub rh_boundary: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HemisphereSelection<T> {
    pub hemisphere: String,
    pub wm_file: T,
    pub mask_file: String,
    pub mesh_file: String,
    pub boundary_file: T,
}

/// `lh` takes the left candidates, every other value the right ones
pub fn select_hemisphere<T: Clone>(
    hemisphere: &str,
    sides: &SideCandidates<T>,
) -> HemisphereSelection<T> {
    let (wm_file, boundary_file) = if hemisphere == "lh" {
        (&sides.lh_wm, &sides.lh_boundary)
    } else {
        (&sides.rh_wm, &sides.rh_boundary)
    };
    HemisphereSelection {
        hemisphere: hemisphere.to_string(),
        wm_file: wm_file.clone(),
        mask_file: format!("{hemisphere}_g0_wm.nii.gz"),
        mesh_file: format!("{hemisphere}_g0_wm.vtk"),
        boundary_file: boundary_file.clone(),
    }
}

/// Bindings of one hemisphere instance: masking outputs for that side plus
/// the side's file names
fn hemisphere_bindings(
    hemisphere: &str,
    sides: &SideCandidates<PortRef>,
) -> Result<Vec<Selection>> {
    let chosen = select_hemisphere(hemisphere, sides);
    Ok(vec![
        Selection::connect(chosen.wm_file, GENUS_ZERO, "in_file"),
        Selection::literal(GENUS_ZERO, "out_mask", chosen.mask_file),
        Selection::literal(SURFACE_GENERATION, "out_file", chosen.mesh_file),
        Selection::connect(chosen.boundary_file, LOGISMOSB, "brainlabels_file"),
        Selection::literal(LOGISMOSB, "basename", chosen.hemisphere.clone()),
        Selection::literal(THICKNESS, "hemisphere", chosen.hemisphere),
    ])
}

fn masking_candidates() -> SideCandidates<PortRef> {
    SideCandidates {
        lh_wm: PortRef::new(WM_MASKING, "lh_wm"),
        rh_wm: PortRef::new(WM_MASKING, "rh_wm"),
        lh_boundary: PortRef::new(WM_MASKING, "lh_boundary"),
        rh_boundary: PortRef::new(WM_MASKING, "rh_boundary"),
    }
}

fn hemisphere_template(config: &PipelineConfig) -> Result<NodeTemplate> {
    let genus_zero = NodeBuilder::new(GENUS_ZERO)
        .stage(tools::genus_zero_image_filter())
        .config(&config.genus_zero)?
        .build()?;
    let surface = NodeBuilder::new(SURFACE_GENERATION)
        .stage(tools::brains_surface_generation())
        .config(&config.surface_generation)?
        .build()?;
    let logismosb = NodeBuilder::new(LOGISMOSB)
        .stage(tools::logismosb())
        .params(config.logismosb.stage_params()?)
        .build()?;
    let thickness = NodeBuilder::new(THICKNESS)
        .stage(tools::compute_distance())
        .param("atlas_info", config.atlas_info.clone())
        .build()?;

    Ok(NodeTemplate::new()
        .node(genus_zero)
        .node(surface)
        .node(logismosb)
        .node(thickness)
        .connect([
            (GENUS_ZERO, "out_file", SURFACE_GENERATION, "in_file"),
            (GENUS_ZERO, "out_file", LOGISMOSB, "wm_file"),
            (SURFACE_GENERATION, "out_file", LOGISMOSB, "mesh_file"),
            (LOGISMOSB, "gmsurface_file", THICKNESS, "gm_file"),
            (LOGISMOSB, "wmsurface_file", THICKNESS, "wm_file"),
        ])
        .shared(links(
            INPUTS,
            LOGISMOSB,
            &[("t1_file", "t1_file"), ("t2_file", "t2_file"), ("hncma_atlas", "atlas_file")],
        ))
        .shared([(GM_LABELMAP, "out_file", THICKNESS, "labels_file")])
        .terminal(LOGISMOSB, "gmsurface_file", "gmsurface_file")
        .terminal(LOGISMOSB, "wmsurface_file", "wmsurface_file"))
}

fn check_hemispheres(config: &PipelineConfig) -> Result<()> {
    for hemisphere in &config.hemisphere_names {
        if !SUPPORTED_HEMISPHERES.contains(&hemisphere.as_str()) {
            return Err(LogisError::configuration_field(
                format!(
                    "hemisphere '{hemisphere}' is not one of {SUPPORTED_HEMISPHERES:?} written by WMMasking"
                ),
                "hemisphere_names",
            ));
        }
    }
    Ok(())
}

/// Build the complete LOGISMOS-B workflow for `config`
pub fn create_logb_workflow(config: &PipelineConfig) -> Result<Workflow> {
    config.validate()?;
    check_hemispheres(config)?;

    let mut workflow = WorkflowBuilder::new(WORKFLOW_NAME)
        .node(identity(INPUTS, INPUT_FIELDS))
        .node_with(|| {
            NodeBuilder::new(WM_MASKING)
                .stage(tools::wm_masking())
                .config(&config.wm_masking)?
                .param("atlas_info", config.atlas_info.clone())
                .build()
        })
        .node_with(|| {
            NodeBuilder::new(GM_LABELMAP)
                .stage(tools::create_gm_label_map())
                .param("atlas_info", config.atlas_info.clone())
                .build()
        })
        .node(per_axis_output_node(OUTPUTS, &OUTPUT_BASES, &config.hemisphere_names))
        .connect(links(
            INPUTS,
            WM_MASKING,
            &[
                ("csf_file", "csf_file"),
                ("fswm_atlas", "atlas_file"),
                ("brainlabels_file", "brainlabels_file"),
            ],
        ))
        .connect([(INPUTS, "fswm_atlas", GM_LABELMAP, "atlas_file")])
        .build()?;

    let template = hemisphere_template(config)?;
    expand(
        &mut workflow,
        HEMISPHERE_AXIS,
        &config.hemisphere_names,
        &masking_candidates(),
        hemisphere_bindings,
        &template,
        OUTPUTS,
    )?;

    maybe_attach(&mut workflow, config.results_root().is_some(), "persistence", |wf| {
        attach_persistence(wf, config)
    })?;
    maybe_attach(&mut workflow, config.maclearn.is_some(), "edge_probability", |wf| {
        attach_edge_probability(wf, config)
    })?;

    workflow.validate()?;
    info!(
        "Assembled {} with {} nodes and {} connections",
        workflow.name(),
        workflow.node_count(),
        workflow.connection_count()
    );
    Ok(workflow)
}

/// Sink slot of one hemisphere's output
fn hemisphere_slot(hemisphere: &str, name: &str) -> String {
    format!("{LOGISMOSB}.@{}", axis_port_name(hemisphere, name))
}

/// Stage outputs persisted per hemisphere: `(node base, port, slot name)`
const PERSISTED: [(&str, &str, &str); 6] = [
    (LOGISMOSB, "gmsurface_file", "gmsurface"),
    (LOGISMOSB, "wmsurface_file", "wmsurface"),
    (LOGISMOSB, "profile_file", "profile"),
    (THICKNESS, "out_file", "thickness"),
    (GENUS_ZERO, "out_file", "g0_mask"),
    (SURFACE_GENERATION, "out_file", "g0_mesh"),
];

const COPIED_INPUTS: [(&str, &str); 7] = [
    ("subject_id", "BAW"),
    ("session_id", "BAW.@a"),
    ("t1_file", "BAW.@b"),
    ("t2_file", "BAW.@c"),
    ("csf_file", "BAW.@d"),
    ("fswm_atlas", "BAW.@e"),
    ("brainlabels_file", "BAW.@f"),
];

fn attach_persistence(workflow: &mut Workflow, config: &PipelineConfig) -> Result<()> {
    let Some(results) = config.results_root() else {
        return Ok(());
    };
    let mut connections: Vec<Connection> = Vec::new();
    let mut slots: Vec<String> = Vec::new();
    let mut route = |source: &str, port: &str, slot: String| {
        connections.push(Connection::new(source, port, DATA_SINK, slot.as_str()));
        slots.push(slot);
    };

    for hemisphere in &config.hemisphere_names {
        for (base, port, name) in PERSISTED {
            route(&axis_port_name(hemisphere, base), port, hemisphere_slot(hemisphere, name));
        }
        route(
            WM_MASKING,
            &format!("{hemisphere}_boundary"),
            hemisphere_slot(hemisphere, "boundary"),
        );
    }
    route(GM_LABELMAP, "out_file", format!("{LOGISMOSB}.@gm_labels"));
    if config.copy_baw {
        for (field, slot) in COPIED_INPUTS {
            route(INPUTS, field, slot.to_string());
        }
    }

    let substitutions = SinkSubstitutions::for_pipeline(
        HEMISPHERE_AXIS,
        &config.hemisphere_names,
        &config.source_directories(),
    );
    debug!("Persisting {} slot(s) under {}", slots.len(), results.display());

    workflow.add_node(
        NodeBuilder::new(BASE_DIR_NAME)
            .stage(results_base_dir())
            .input("results_dir", results.to_string_lossy().into_owned())
            .build()?,
    )?;
    workflow.add_node(Node::stage(
        DATA_SINK,
        DataSink::new(slots, substitutions),
        Default::default(),
    ))?;
    workflow.connect(links(
        INPUTS,
        BASE_DIR_NAME,
        &[("subject_id", "subject_id"), ("session_id", "session")],
    ))?;
    workflow.connect([(BASE_DIR_NAME, "base_dir", DATA_SINK, "base_directory")])?;
    workflow.connect(connections)
}

fn attach_edge_probability(workflow: &mut Workflow, config: &PipelineConfig) -> Result<()> {
    let Some(ml) = &config.maclearn else {
        return Ok(());
    };
    let ml_fields: Vec<&str> = EDGE_PROBABILITY_INPUTS
        .iter()
        .copied()
        .filter(|field| *field != "t1_file")
        .collect();
    workflow.add_node(identity(ML_INPUTS, ml_fields.iter().copied()))?;
    if let Some(classifier) = &ml.classifier_file {
        workflow.set_input(ML_INPUTS, "classifier_file", classifier.to_string_lossy().into_owned())?;
    }
    workflow.add_node(Node::subgraph(create_machine_learning_workflow(
        EDGE_PROBABILITY,
        &ml.edge_name,
        ml.resample,
    )?))?;

    let mut connections: Vec<Connection> = ml_fields
        .iter()
        .map(|field| Connection::new(ML_INPUTS, *field, EDGE_PROBABILITY, format!("{INPUTS}.{field}")))
        .collect();
    connections.push(Connection::new(INPUTS, "t1_file", EDGE_PROBABILITY, "Inputs.t1_file"));
    for hemisphere in &config.hemisphere_names {
        connections.push(Connection::new(
            EDGE_PROBABILITY,
            "Outputs.probability_map",
            axis_port_name(hemisphere, LOGISMOSB),
            "gm_proba_file",
        ));
    }
    workflow.connect(connections)
}

/// `MLInputs` ports a run of the edge-probability branch cannot do without.
/// The transform is only used when feature images are resampled.
pub fn required_edge_probability_inputs(ml: &MachineLearningConfig) -> Vec<&'static str> {
    let mut required = vec!["rho", "phi", "theta", "classifier_file"];
    if ml.resample {
        required.push("acpc_transform");
    }
    required
}

/// Reject a workflow whose edge-probability branch is missing a value on a
/// required input. Workflows without the branch pass.
pub fn check_edge_probability_inputs(workflow: &Workflow, config: &PipelineConfig) -> Result<()> {
    let Some(ml) = &config.maclearn else {
        return Ok(());
    };
    let missing: Vec<&str> = required_edge_probability_inputs(ml)
        .into_iter()
        .filter(|port| !workflow.is_bound(ML_INPUTS, port))
        .collect();
    match missing.first() {
        None => Ok(()),
        Some(first) => Err(LogisError::configuration_field(
            format!("edge probability inputs {missing:?} have no value"),
            format!("{ML_INPUTS}.{first}"),
        )),
    }
}
