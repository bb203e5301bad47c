//! Workflows around the gray matter edge classifier.

use crate::core::config::LogismosbParams;
use crate::core::errors::Result;
use crate::dag_flow::{
    axis_port_name, identity, links, per_axis_output_node, Connection, Node, NodeBuilder,
    Workflow, WorkflowBuilder,
};
use crate::maclearn::GaussianNb;
use crate::stages::function::ones_image;
use crate::stages::{tools, CollectFeatureFiles, CreateReferenceImage, PredictEdgeProbability};

const INPUTS: &str = "Inputs";
const OUTPUTS: &str = "Outputs";

/// Boundary inputs of the edge probability workflow
pub const EDGE_PROBABILITY_INPUTS: [&str; 7] = [
    "rho",
    "phi",
    "theta",
    "posteriors",
    "t1_file",
    "acpc_transform",
    "classifier_file",
];

/// Feature files are collected from the inputs and fed to the stored
/// classifier. With `resample` every feature image is first brought onto the
/// T1 grid through the inverse of `acpc_transform`.
pub fn create_machine_learning_workflow(name: &str, edge_name: &str, resample: bool) -> Result<Workflow> {
    WorkflowBuilder::new(name)
        .node(identity(INPUTS, EDGE_PROBABILITY_INPUTS))
        .node(
            NodeBuilder::new("PredictEdgeProbability")
                .stage(PredictEdgeProbability::<GaussianNb>::new())
                .input("out_file", format!("{edge_name}_edge_probability_map.nii.gz"))
                .build()?,
        )
        .node(
            NodeBuilder::new("CollectFeatureFiles")
                .stage(CollectFeatureFiles::new(resample))
                .param("inverse_transform", true)
                .build()?,
        )
        .node(identity(OUTPUTS, ["probability_map"]))
        .connect(links(
            INPUTS,
            "PredictEdgeProbability",
            &[("t1_file", "t1_file"), ("classifier_file", "classifier_file")],
        ))
        .connect(links(
            INPUTS,
            "CollectFeatureFiles",
            &[
                ("rho", "rho"),
                ("phi", "phi"),
                ("theta", "theta"),
                ("posteriors", "posterior_files"),
                ("t1_file", "reference_file"),
                ("acpc_transform", "transform_file"),
            ],
        ))
        .connect([
            ("CollectFeatureFiles", "feature_files", "PredictEdgeProbability", "additional_files"),
            ("PredictEdgeProbability", "out_file", OUTPUTS, "probability_map"),
        ])
        .build()
}

const RESAMPLED: [&str; 4] = ["t1_file", "t2_file", "hncma_file", "abc_file"];
const LABEL_MAPS: [&str; 2] = ["hncma_file", "abc_file"];

/// Resample the BAW images onto `reference_file`; label maps use nearest
/// neighbor interpolation.
pub fn create_workflow_to_resample_baw_files(name: &str) -> Result<Workflow> {
    let mut builder = WorkflowBuilder::new(name)
        .node(identity(
            INPUTS,
            RESAMPLED.iter().copied().chain(["reference_file", "acpc_transform"]),
        ))
        .node(identity(OUTPUTS, RESAMPLED));

    for input in RESAMPLED {
        let node = format!("Resample_{input}");
        let interpolation = if LABEL_MAPS.contains(&input) {
            Some("NearestNeighbor")
        } else {
            None
        };
        builder = builder
            .node_with(|| {
                let mut resample = NodeBuilder::new(node.as_str())
                    .stage(tools::brains_resample())
                    .param("pixelType", "short")
                    .param("inverseTransform", true)
                    .input("outputVolume", format!("{input}_resampled.nii.gz"));
                if let Some(mode) = interpolation {
                    resample = resample.param("interpolationMode", mode);
                }
                resample.build()
            })
            .connect(links(
                INPUTS,
                &node,
                &[
                    ("reference_file", "referenceVolume"),
                    ("acpc_transform", "warpTransform"),
                    (input, "inputVolume"),
                ],
            ))
            .connect([(node.as_str(), "outputVolume", OUTPUTS, input)]);
    }
    builder.build()
}

/// Voxel mask of the region enclosed by a FreeSurfer white surface, on the
/// grid of `t1_file` in LPS orientation.
pub fn create_workflow_to_mask_white_matter(name: &str) -> Result<Workflow> {
    WorkflowBuilder::new(name)
        .node(identity(INPUTS, ["t1_file", "white"]))
        .node(
            NodeBuilder::new("T1toLIA")
                .stage(tools::mri_convert())
                .param("out_orientation", "LIA")
                .input("out_file", "t1_lia.nii.gz")
                .build()?,
        )
        .node(
            NodeBuilder::new("Ones_Image")
                .stage(ones_image())
                .input("out_file", "ones.nii.gz")
                .build()?,
        )
        .node(
            NodeBuilder::new("WhiteMask")
                .stage(tools::surface_mask())
                .input("out_file", "white_ras.nii.gz")
                .build()?,
        )
        .node(
            NodeBuilder::new("MasktoNIFTI")
                .stage(tools::mri_convert())
                .param("out_orientation", "LPS")
                .input("out_file", "white.nii.gz")
                .build()?,
        )
        .node(identity(OUTPUTS, ["white_mask"]))
        .connect([
            (INPUTS, "t1_file", "T1toLIA", "in_file"),
            ("T1toLIA", "out_file", "Ones_Image", "in_volume"),
            ("Ones_Image", "out_file", "WhiteMask", "in_volume"),
            (INPUTS, "white", "WhiteMask", "in_surface"),
            ("WhiteMask", "out_file", "MasktoNIFTI", "in_file"),
            ("MasktoNIFTI", "out_file", OUTPUTS, "white_mask"),
        ])
        .build()
}

const ML_LOGB_INPUTS: [&str; 11] = [
    "rho",
    "phi",
    "theta",
    "posteriors",
    "t1_file",
    "t2_file",
    "acpc_transform",
    "classifier_file",
    "orig_t1",
    "hncma_file",
    "abc_file",
];

const ML_SURFACES: [(&str, &str); 2] = [
    ("gmsurface_file", "gm_surface_file"),
    ("wmsurface_file", "wm_surface_file"),
];

/// LOGISMOS-B driven by FreeSurfer white surfaces and the predicted gray
/// matter edge probability. An empty `hemispheres` means `lh` and `rh`.
///
/// With `resample` the BAW images are resampled onto the raw T1 first;
/// otherwise they are used as given.
pub fn create_logismosb_machine_learning_workflow(
    name: &str,
    resample: bool,
    hemispheres: &[String],
    params: &LogismosbParams,
) -> Result<Workflow> {
    let hemispheres: Vec<String> = if hemispheres.is_empty() {
        vec!["lh".into(), "rh".into()]
    } else {
        hemispheres.to_vec()
    };
    let surface_bases: Vec<&str> = ML_SURFACES.iter().map(|(_, base)| *base).collect();
    let white_surfaces = hemispheres.iter().map(|h| format!("{h}_white_surface_file"));

    let mut workflow = Workflow::new(name);
    workflow.add_node(identity(
        INPUTS,
        ML_LOGB_INPUTS
            .iter()
            .map(|field| field.to_string())
            .chain(white_surfaces),
    ))?;
    workflow.add_node(per_axis_output_node(OUTPUTS, &surface_bases, &hemispheres))?;

    // Node and port providing each BAW image to the downstream stages
    let provider: fn(&str) -> (String, String) = if resample {
        |field| ("ResampleBAWOutputs".to_string(), format!("{OUTPUTS}.{field}"))
    } else {
        |field| (INPUTS.to_string(), field.to_string())
    };

    if resample {
        workflow.add_node(
            NodeBuilder::new("ResampleInputT1")
                .stage(CreateReferenceImage)
                .build()?,
        )?;
        workflow.add_node(Node::subgraph(create_workflow_to_resample_baw_files(
            "ResampleBAWOutputs",
        )?))?;
        let mut connections = links(
            INPUTS,
            "ResampleInputT1",
            &[("orig_t1", "orig_t1"), ("t1_file", "baw_t1")],
        );
        connections.push(Connection::new(
            "ResampleInputT1",
            "reference_file",
            "ResampleBAWOutputs",
            "Inputs.reference_file",
        ));
        for field in RESAMPLED.iter().copied().chain(["acpc_transform"]) {
            connections.push(Connection::new(
                INPUTS,
                field,
                "ResampleBAWOutputs",
                format!("{INPUTS}.{field}"),
            ));
        }
        workflow.connect(connections)?;
    }

    let (t1_node, t1_port) = provider("t1_file");
    workflow.add_node(Node::subgraph(create_machine_learning_workflow(
        "CreateEdgeProbabilityMap",
        "gm",
        resample,
    )?))?;
    let mut connections: Vec<Connection> = ["rho", "phi", "theta", "posteriors", "acpc_transform", "classifier_file"]
        .into_iter()
        .map(|field| Connection::new(INPUTS, field, "CreateEdgeProbabilityMap", format!("{INPUTS}.{field}")))
        .collect();
    connections.push(Connection::new(
        t1_node.as_str(),
        t1_port.as_str(),
        "CreateEdgeProbabilityMap",
        "Inputs.t1_file",
    ));
    workflow.connect(connections)?;

    let stage_params = params.stage_params()?;
    for hemisphere in &hemispheres {
        let mask = axis_port_name(hemisphere, "MaskWhiteMatter");
        let convert = axis_port_name(hemisphere, "Convert_White");
        let logb = axis_port_name(hemisphere, "LOGISMOSB");
        let white = format!("{hemisphere}_white_surface_file");

        workflow.add_node(Node::subgraph(create_workflow_to_mask_white_matter(&mask)?))?;
        workflow.add_node(
            NodeBuilder::new(convert.as_str())
                .stage(tools::mris_convert())
                .param("to_scanner", true)
                .input("out_file", format!("{hemisphere}_white.vtk"))
                .build()?,
        )?;
        workflow.add_node(
            NodeBuilder::new(logb.as_str())
                .stage(tools::logismosb())
                .params(stage_params.clone())
                .input("basename", hemisphere.as_str())
                .build()?,
        )?;

        let mut connections = vec![
            Connection::new(INPUTS, white.as_str(), mask.as_str(), "Inputs.white"),
            Connection::new(t1_node.as_str(), t1_port.as_str(), mask.as_str(), "Inputs.t1_file"),
            Connection::new(INPUTS, white.as_str(), convert.as_str(), "in_file"),
            Connection::new(convert.as_str(), "converted", logb.as_str(), "mesh_file"),
            Connection::new(mask.as_str(), "Outputs.white_mask", logb.as_str(), "wm_file"),
            Connection::new(
                "CreateEdgeProbabilityMap",
                "Outputs.probability_map",
                logb.as_str(),
                "gm_proba_file",
            ),
        ];
        for (field, port) in [
            ("hncma_file", "atlas_file"),
            ("abc_file", "brainlabels_file"),
            ("t1_file", "t1_file"),
            ("t2_file", "t2_file"),
        ] {
            let (node, source_port) = provider(field);
            connections.push(Connection::new(node, source_port, logb.as_str(), port));
        }
        for (port, base) in ML_SURFACES {
            connections.push(Connection::new(
                logb.as_str(),
                port,
                OUTPUTS,
                axis_port_name(hemisphere, base),
            ));
        }
        workflow.connect(connections)?;
    }

    workflow.validate()?;
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::tests::SAMPLE_YAML;
    use crate::core::config::PipelineConfig;
    use crate::dag_flow::PortRef;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    #[test]
    fn test_edge_probability_boundary() {
        let wf = create_machine_learning_workflow("CreateEdgeProbabilityMap", "gm", true).unwrap();
        assert_eq!(wf.node(INPUTS).unwrap().input_names(), EDGE_PROBABILITY_INPUTS.to_vec());
        assert_eq!(wf.node(OUTPUTS).unwrap().output_names(), vec!["probability_map"]);
        assert_eq!(
            wf.node("PredictEdgeProbability").unwrap().literals()["out_file"],
            Value::from("gm_edge_probability_map.nii.gz")
        );
        wf.validate().unwrap();
    }

    #[test]
    fn test_edge_probability_without_resampling() {
        let wf = create_machine_learning_workflow("Edges", "wm", false).unwrap();
        let producer = wf
            .producer_of(&PortRef::new("PredictEdgeProbability", "additional_files"))
            .unwrap();
        assert_eq!(producer.source, PortRef::new("CollectFeatureFiles", "feature_files"));
        assert_eq!(
            wf.node("PredictEdgeProbability").unwrap().literals()["out_file"],
            Value::from("wm_edge_probability_map.nii.gz")
        );
    }

    #[test]
    fn test_resample_baw_interpolation() {
        let wf = create_workflow_to_resample_baw_files("ResampleBAWOutputs").unwrap();
        let params = |node: &str| wf.node(node).unwrap().params().clone();
        assert_eq!(
            params("Resample_abc_file").get("interpolationMode"),
            Some(&Value::from("NearestNeighbor"))
        );
        assert!(params("Resample_t1_file").get("interpolationMode").is_none());
        assert!(wf.is_bound(OUTPUTS, "hncma_file"));
        wf.validate().unwrap();
    }

    #[test]
    fn test_mask_white_matter_chain() {
        let wf = create_workflow_to_mask_white_matter("lh_MaskWhiteMatter").unwrap();
        let producer = wf.producer_of(&PortRef::new(OUTPUTS, "white_mask")).unwrap();
        assert_eq!(producer.source, PortRef::new("MasktoNIFTI", "out_file"));
        assert_eq!(wf.topological_order().unwrap().len(), 6);
    }

    #[test]
    fn test_logismosb_machine_learning_outputs() {
        let params = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap().logismosb;
        let wf = create_logismosb_machine_learning_workflow("MachineLearningLOGISMOSB", true, &[], &params)
            .unwrap();
        assert_eq!(
            wf.node(OUTPUTS).unwrap().output_names(),
            vec![
                "lh_gm_surface_file",
                "lh_wm_surface_file",
                "rh_gm_surface_file",
                "rh_wm_surface_file"
            ]
        );
        let proba = wf
            .producer_of(&PortRef::new("rh_LOGISMOSB", "gm_proba_file"))
            .unwrap();
        assert_eq!(
            proba.source,
            PortRef::new("CreateEdgeProbabilityMap", "Outputs.probability_map")
        );
        let atlas = wf.producer_of(&PortRef::new("lh_LOGISMOSB", "atlas_file")).unwrap();
        assert_eq!(atlas.source, PortRef::new("ResampleBAWOutputs", "Outputs.hncma_file"));
    }

    #[test]
    fn test_logismosb_machine_learning_without_resampling() {
        let params = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap().logismosb;
        let wf = create_logismosb_machine_learning_workflow("ML", false, &["lh".to_string()], &params)
            .unwrap();
        assert!(!wf.contains("ResampleBAWOutputs"));
        let t1 = wf.producer_of(&PortRef::new("lh_LOGISMOSB", "t1_file")).unwrap();
        assert_eq!(t1.source, PortRef::new(INPUTS, "t1_file"));
        assert!(!wf.contains("rh_LOGISMOSB"));
    }
}
