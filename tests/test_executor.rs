use anyhow::bail;
use logismosb::dag_flow::{
    expand, per_axis_output_node, Node, NodeBuilder, NodeStatus, NodeTemplate, PortRef, PortSpec,
    PortValues, Selection, Workflow, WorkflowBuilder,
};
use logismosb::stages::{FunctionStage, StageCtx};
use logismosb::{LocalExecutor, Result};
use pretty_assertions::assert_eq;
use serde_json::Value;

fn double_value(ctx: &StageCtx) -> anyhow::Result<PortValues> {
    let value: f64 = ctx.get_input("value")?;
    Ok(PortValues::from([("value".to_string(), Value::from(value * 2.0))]))
}

fn always_fail(_ctx: &StageCtx) -> anyhow::Result<PortValues> {
    bail!("tool exited with status 1")
}

fn write_marker(ctx: &StageCtx) -> anyhow::Result<PortValues> {
    std::fs::create_dir_all(&ctx.work_dir)?;
    let name: String = ctx.get_input("name")?;
    let path = ctx.output_path(name);
    std::fs::write(&path, ctx.node_name.as_bytes())?;
    Ok(PortValues::from([(
        "out_file".to_string(),
        Value::from(path.to_string_lossy().into_owned()),
    )]))
}

fn doubler() -> FunctionStage {
    FunctionStage::new("Double", vec![PortSpec::value("value")], vec![PortSpec::value("value")], double_value)
}

fn failing() -> FunctionStage {
    FunctionStage::new("Fail", vec![PortSpec::value("value")], vec![PortSpec::value("value")], always_fail)
}

fn marker() -> FunctionStage {
    FunctionStage::new("Marker", vec![PortSpec::value("name")], vec![PortSpec::file("out_file")], write_marker)
}

fn stage(name: &str, stage: FunctionStage) -> Node {
    NodeBuilder::new(name).stage(stage).build().unwrap()
}

#[tokio::test]
async fn test_values_flow_through_chain() {
    let dir = tempfile::tempdir().unwrap();
    let wf = WorkflowBuilder::new("chain")
        .node(Node::identity("Inputs", ["x"]))
        .node(stage("First", doubler()))
        .node(stage("Second", doubler()))
        .node(Node::identity("Outputs", ["result"]))
        .connect([
            ("Inputs", "x", "First", "value"),
            ("First", "value", "Second", "value"),
            ("Second", "value", "Outputs", "result"),
        ])
        .literal("Inputs", "x", 2.0)
        .build()
        .unwrap();

    let report = LocalExecutor::new(dir.path()).run(&wf).await.unwrap();
    assert!(report.success());
    assert_eq!(report.outputs("Outputs").unwrap()["result"], Value::from(8.0));
    assert_eq!(
        report.outcome("Second").unwrap().work_dir,
        Some(dir.path().join("chain").join("Second"))
    );
}

#[tokio::test]
async fn test_failure_skips_dependents_only() {
    let dir = tempfile::tempdir().unwrap();
    let wf = WorkflowBuilder::new("branches")
        .node(Node::identity("Inputs", ["x"]))
        .node(stage("Broken", failing()))
        .node(stage("AfterBroken", doubler()))
        .node(stage("Independent", doubler()))
        .connect([
            ("Inputs", "x", "Broken", "value"),
            ("Broken", "value", "AfterBroken", "value"),
            ("Inputs", "x", "Independent", "value"),
        ])
        .literal("Inputs", "x", 1.5)
        .build()
        .unwrap();

    let report = LocalExecutor::new(dir.path())
        .max_parallel_nodes(1)
        .run(&wf)
        .await
        .unwrap();
    assert!(!report.success());
    assert_eq!(report.status("Broken"), Some(NodeStatus::Failed));
    assert_eq!(report.status("AfterBroken"), Some(NodeStatus::Skipped));
    assert_eq!(report.status("Independent"), Some(NodeStatus::Completed));
    assert_eq!(report.outputs("Independent").unwrap()["value"], Value::from(3.0));

    let broken = report.outcome("Broken").unwrap();
    assert_eq!(broken.error_category, Some("stage_execution"));
    assert!(broken.error.as_deref().unwrap().contains("status 1"));
}

#[tokio::test]
async fn test_missing_required_input_fails_node() {
    let dir = tempfile::tempdir().unwrap();
    let wf = WorkflowBuilder::new("unset")
        .node(Node::identity("Inputs", ["x"]))
        .node(stage("First", doubler()))
        .connect([("Inputs", "x", "First", "value")])
        .build()
        .unwrap();

    let report = LocalExecutor::new(dir.path()).run(&wf).await.unwrap();
    assert_eq!(report.status("Inputs"), Some(NodeStatus::Completed));
    assert_eq!(report.status("First"), Some(NodeStatus::Failed));
}

#[tokio::test]
async fn test_nested_workflow_is_flattened() {
    let dir = tempfile::tempdir().unwrap();
    let inner = WorkflowBuilder::new("Inner")
        .node(Node::identity("Inputs", ["x"]))
        .node(stage("Double", doubler()))
        .node(Node::identity("Outputs", ["y"]))
        .connect([
            ("Inputs", "x", "Double", "value"),
            ("Double", "value", "Outputs", "y"),
        ])
        .build()
        .unwrap();
    let mut outer = Workflow::new("outer");
    outer.add_node(Node::subgraph(inner)).unwrap();
    outer.add_node(stage("After", doubler())).unwrap();
    outer.set_input("Inner", "Inputs.x", 5.0).unwrap();
    outer.connect([("Inner", "Outputs.y", "After", "value")]).unwrap();

    let report = LocalExecutor::new(dir.path()).run(&outer).await.unwrap();
    assert!(report.success());
    assert_eq!(report.outputs("After").unwrap()["value"], Value::from(20.0));
    assert_eq!(
        report.outcome("Inner.Double").unwrap().work_dir,
        Some(dir.path().join("outer").join("Inner").join("Double"))
    );
}

fn name_per_value(value: &str, _: &()) -> Result<Vec<Selection>> {
    Ok(vec![Selection::literal("Mark", "name", format!("{value}.txt"))])
}

#[tokio::test]
async fn test_fanout_instances_get_axis_work_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::new("fan");
    wf.add_node(per_axis_output_node("Outputs", &["marker"], &["lh", "rh"]))
        .unwrap();
    let template = NodeTemplate::new()
        .node(stage("Mark", marker()))
        .terminal("Mark", "out_file", "marker");
    expand(&mut wf, "hemisphere", &["lh", "rh"], &(), name_per_value, &template, "Outputs").unwrap();
    assert!(wf.producer_of(&PortRef::new("Outputs", "rh_marker")).is_some());

    let report = LocalExecutor::new(dir.path()).run(&wf).await.unwrap();
    assert!(report.success());
    let expected = dir.path().join("fan").join("_hemisphere_rh").join("Mark").join("rh.txt");
    assert_eq!(
        report.outputs("Outputs").unwrap()["rh_marker"],
        Value::from(expected.to_string_lossy().into_owned())
    );
    assert_eq!(std::fs::read_to_string(&expected).unwrap(), "rh_Mark");
}

#[tokio::test]
async fn test_unvalidated_workflow_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut wf = Workflow::new("incomplete");
    wf.add_node(stage("First", doubler())).unwrap();
    let err = LocalExecutor::new(dir.path()).run(&wf).await.unwrap_err();
    assert!(err.is_assembly_error());
}
