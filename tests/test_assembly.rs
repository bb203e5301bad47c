use logismosb::dag_flow::{maybe_attach, Node, NodeBuilder, PortRef, Workflow};
use logismosb::pipeline::logismosb::ML_INPUTS;
use logismosb::pipeline::subjects::read_subjects_from;
use logismosb::pipeline::{create_logb_workflow, select_hemisphere, HemisphereSelection, SideCandidates};
use logismosb::stages::tools;
use logismosb::{BatchRunner, LocalExecutor, LogisError, PipelineConfig};
use pretty_assertions::assert_eq;
use serde_json::Value;

const CONFIG: &str = r#"
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

fn config() -> PipelineConfig {
    PipelineConfig::from_yaml_str(CONFIG).unwrap()
}

#[test]
fn test_output_ports_follow_hemisphere_names() {
    let wf = create_logb_workflow(&config()).unwrap();
    assert_eq!(
        wf.node("Outputs").unwrap().output_names(),
        vec!["lh_gmsurface_file", "lh_wmsurface_file", "rh_gmsurface_file", "rh_wmsurface_file"]
    );
    for hemisphere in ["lh", "rh"] {
        for base in ["gmsurface_file", "wmsurface_file"] {
            let producer = wf
                .producer_of(&PortRef::new("Outputs", format!("{hemisphere}_{base}")))
                .unwrap();
            assert_eq!(producer.source, PortRef::new(format!("{hemisphere}_LOGISMOSB"), base));
        }
    }
}

#[test]
fn test_empty_hemisphere_list() {
    let config = PipelineConfig {
        hemisphere_names: Vec::new(),
        ..config()
    };
    let wf = create_logb_workflow(&config).unwrap();
    assert_eq!(wf.axis_instances("hemisphere"), 0);
    assert!(wf.node("Outputs").unwrap().output_names().is_empty());
    assert!(wf.contains("WMMasking"));
}

#[test]
fn test_second_producer_is_rejected_without_side_effects() {
    let mut wf = create_logb_workflow(&config()).unwrap();
    let connections = wf.connection_count();
    let err = wf
        .connect([("Inputs", "t1_file", "lh_GenusZeroImageFilter", "in_file")])
        .unwrap_err();
    assert!(matches!(err, LogisError::GraphConstruction { .. }));
    assert_eq!(wf.connection_count(), connections);
    let producer = wf
        .producer_of(&PortRef::new("lh_GenusZeroImageFilter", "in_file"))
        .unwrap();
    assert_eq!(producer.source, PortRef::new("WMMasking", "lh_wm"));
}

#[test]
fn test_batch_connect_rolls_back() {
    let mut wf = Workflow::new("wf");
    wf.add_node(Node::identity("Inputs", ["a"])).unwrap();
    wf.add_node(Node::stage("G0", tools::genus_zero_image_filter(), Default::default()))
        .unwrap();
    let err = wf
        .connect([
            ("Inputs", "a", "G0", "in_file"),
            ("Inputs", "a", "G0", "no_such_port"),
        ])
        .unwrap_err();
    assert!(err.is_assembly_error());
    assert_eq!(wf.connection_count(), 0);
    assert!(!wf.is_bound("G0", "in_file"));
}

#[test]
fn test_hemisphere_selection() {
    let sides = SideCandidates {
        lh_wm: "X",
        rh_wm: "Y",
        lh_boundary: "A",
        rh_boundary: "B",
    };
    let expected = |h: &str, wm: &'static str, boundary: &'static str| HemisphereSelection {
        hemisphere: h.to_string(),
        wm_file: wm,
        mask_file: format!("{h}_g0_wm.nii.gz"),
        mesh_file: format!("{h}_g0_wm.vtk"),
        boundary_file: boundary,
    };
    assert_eq!(select_hemisphere("lh", &sides), expected("lh", "X", "A"));
    assert_eq!(select_hemisphere("rh", &sides), expected("rh", "Y", "B"));
}

#[test]
fn test_thick_region_setting_is_required() {
    let yaml = CONFIG.replace("  thickRegions: [1006, 2006]\n", "");
    let err = PipelineConfig::from_yaml_str(&yaml).unwrap_err();
    assert!(matches!(err, LogisError::Configuration { .. }));

    let yaml = CONFIG.replace("thickRegions: [1006, 2006]", "thickRegions: []");
    assert!(PipelineConfig::from_yaml_str(&yaml).is_err());

    let yaml = CONFIG.replace("thickRegions: [1006, 2006]", "useHNCMALabels: true");
    let wf = create_logb_workflow(&PipelineConfig::from_yaml_str(&yaml).unwrap()).unwrap();
    let params = wf.node("lh_LOGISMOSB").unwrap().params();
    assert_eq!(params.get("useHNCMALabels"), Some(&Value::Bool(true)));
}

#[test]
fn test_stage_parameters_come_from_config() {
    let wf = create_logb_workflow(&config()).unwrap();
    let g0 = wf.node("rh_GenusZeroImageFilter").unwrap().params();
    assert_eq!(g0.get("connectivity"), Some(&Value::from(18)));
    let logb = wf.node("lh_LOGISMOSB").unwrap();
    assert_eq!(logb.params().get("nColumns"), Some(&Value::from(300)));
    assert_eq!(logb.literals()["basename"], Value::from("lh"));
    let thickness = wf.node("lh_ctx_thickness").unwrap();
    assert_eq!(thickness.literals()["hemisphere"], Value::from("lh"));
    assert_eq!(
        wf.producer_of(&PortRef::new("rh_ctx_thickness", "labels_file")).unwrap().source,
        PortRef::new("GM_Labelmap", "out_file")
    );
}

#[test]
fn test_persistence_branch_wiring() {
    let yaml = format!("{CONFIG}Results_Directory: /results\nBAW_Directories: [/Shared/baw]\n");
    let wf = create_logb_workflow(&PipelineConfig::from_yaml_str(&yaml).unwrap()).unwrap();
    assert_eq!(
        wf.node("Base_Dir_Name").unwrap().literals()["results_dir"],
        Value::from("/results")
    );
    assert_eq!(
        wf.producer_of(&PortRef::new("LOGISMOSB_DataSink", "LOGISMOSB.@rh_thickness"))
            .unwrap()
            .source,
        PortRef::new("rh_ctx_thickness", "out_file")
    );
    assert!(!wf.is_bound("LOGISMOSB_DataSink", "BAW"));
    assert!(!wf.node("LOGISMOSB_DataSink").unwrap().has_input("BAW"));
}

#[test]
fn test_edge_probability_branch_feeds_every_hemisphere() {
    let yaml = format!("{CONFIG}maclearn:\n  edge_name: gm\n  resample: false\n");
    let wf = create_logb_workflow(&PipelineConfig::from_yaml_str(&yaml).unwrap()).unwrap();
    for hemisphere in ["lh", "rh"] {
        let producer = wf
            .producer_of(&PortRef::new(format!("{hemisphere}_LOGISMOSB"), "gm_proba_file"))
            .unwrap();
        assert_eq!(
            producer.source,
            PortRef::new("CreateEdgeProbabilityMap", "Outputs.probability_map")
        );
    }
    assert!(wf.is_bound("CreateEdgeProbabilityMap", "Inputs.t1_file"));
    assert!(!wf.node("MLInputs").unwrap().literals().contains_key("classifier_file"));
}

#[test]
fn test_branch_must_only_append() {
    let mut wf = create_logb_workflow(&config()).unwrap();
    let nodes = wf.node_count();

    let attached = maybe_attach(&mut wf, false, "disabled", |_| unreachable!()).unwrap();
    assert!(!attached);

    let err = maybe_attach(&mut wf, true, "extra", |wf| {
        wf.add_node(
            NodeBuilder::new("Extra_Thickness")
                .stage(tools::compute_distance())
                .build()?,
        )?;
        wf.set_input("lh_LOGISMOSB", "gm_proba_file", "/tmp/proba.nii.gz")
    })
    .unwrap_err();
    assert!(err.is_assembly_error());
    assert_eq!(wf.node_count(), nodes);
    assert!(!wf.contains("Extra_Thickness"));
    assert!(!wf.is_bound("lh_LOGISMOSB", "gm_proba_file"));
}

const SUBJECT_COLUMNS: &str =
    "subject_id,session_id,t1_file,t2_file,csf_file,fswm_atlas,brainlabels_file,hncma_atlas";
const SUBJECT_ROW: &str =
    "0131,89205,/d/t1.nii.gz,,/d/csf.nii.gz,/d/fswm.nii.gz,/d/labels.nii.gz,/d/hncma.nii.gz";

fn ml_runner(maclearn: &str) -> BatchRunner {
    let yaml = format!("{CONFIG}maclearn:\n{maclearn}");
    BatchRunner::new(PipelineConfig::from_yaml_str(&yaml).unwrap(), LocalExecutor::new("/tmp/logb"))
}

#[test]
fn test_batch_assembly_requires_edge_probability_inputs() {
    let csv = format!("{SUBJECT_COLUMNS}\n{SUBJECT_ROW}\n");
    let subject = read_subjects_from(csv.as_bytes()).unwrap().remove(0);

    let err = ml_runner("  classifier_file: /clf/GMBaseCLF.clf\n")
        .assemble(&subject)
        .unwrap_err();
    assert!(err.is_assembly_error());
    assert!(matches!(
        err,
        LogisError::Configuration { field: Some(ref f), .. } if f == "MLInputs.rho"
    ));
    assert!(err.to_string().contains("acpc_transform"));
}

#[test]
fn test_batch_assembly_binds_edge_probability_inputs() {
    let csv = format!(
        "{SUBJECT_COLUMNS},rho,phi,theta,posteriors,acpc_transform\n\
         {SUBJECT_ROW},/d/rho.nii.gz,/d/phi.nii.gz,/d/theta.nii.gz,CSF=/d/csf_p.nii.gz,/d/acpc.h5\n"
    );
    let subject = read_subjects_from(csv.as_bytes()).unwrap().remove(0);
    let wf = ml_runner("  classifier_file: /clf/GMBaseCLF.clf\n")
        .assemble(&subject)
        .unwrap();
    wf.validate().unwrap();
    for port in ["rho", "phi", "theta", "posteriors", "acpc_transform", "classifier_file"] {
        assert!(wf.is_bound(ML_INPUTS, port), "{port} has no value");
    }
    assert_eq!(
        wf.node(ML_INPUTS).unwrap().literals()["posteriors"],
        serde_json::json!({"CSF": "/d/csf_p.nii.gz"})
    );
}

#[test]
fn test_batch_assembly_without_resampling_needs_no_transform() {
    let csv = format!("{SUBJECT_COLUMNS},rho,phi,theta\n{SUBJECT_ROW},/d/rho.nii.gz,/d/phi.nii.gz,/d/theta.nii.gz\n");
    let subject = read_subjects_from(csv.as_bytes()).unwrap().remove(0);

    let runner = ml_runner("  classifier_file: /clf/GMBaseCLF.clf\n  resample: false\n");
    assert!(runner.assemble(&subject).is_ok());

    let err = ml_runner("  resample: false\n").assemble(&subject).unwrap_err();
    assert!(matches!(
        err,
        LogisError::Configuration { field: Some(ref f), .. } if f == "MLInputs.classifier_file"
    ));
}
