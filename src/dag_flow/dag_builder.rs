//! Fluent builders for nodes and workflows

use serde::Serialize;
use serde_json::Value;

use super::dag_flow::{Connection, Node, ParamRecord, Workflow};
use crate::core::errors::{LogisError, Result};
use crate::stages::StageInterface;

/// Identity node declaring `fields` as both inputs and outputs
pub fn identity<I, S>(name: impl Into<String>, fields: I) -> Node
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Node::identity(name, fields)
}

/// Port name of one axis value's copy of `base`
pub fn axis_port_name(axis_value: &str, base: &str) -> String {
    format!("{axis_value}_{base}")
}

/// Identity node exposing `{value}_{base}` for every axis value and base
/// name, grouped by axis value.
pub fn per_axis_output_node<B, V>(name: impl Into<String>, base_names: &[B], axis_values: &[V]) -> Node
where
    B: AsRef<str>,
    V: AsRef<str>,
{
    let fields = axis_values.iter().flat_map(|value| {
        base_names
            .iter()
            .map(move |base| axis_port_name(value.as_ref(), base.as_ref()))
    });
    Node::identity(name, fields.collect::<Vec<_>>())
}

/// Builder for stage nodes
#[derive(Debug)]
pub struct NodeBuilder {
    name: String,
    stage: Option<Box<dyn StageInterface>>,
    params: ParamRecord,
    literals: Vec<(String, Value)>,
}

impl NodeBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            stage: None,
            params: ParamRecord::new(),
            literals: Vec::new(),
        }
    }

    pub fn stage<T: StageInterface + 'static>(mut self, stage: T) -> Self {
        self.stage = Some(Box::new(stage));
        self
    }

    pub fn param<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(mut self, params: ParamRecord) -> Self {
        self.params.extend(params);
        self
    }

    /// Merge the fields of a serializable record into the parameters
    pub fn config<T: Serialize>(mut self, config: &T) -> Result<Self> {
        match serde_json::to_value(config)? {
            Value::Object(map) => {
                self.params.extend(map);
                Ok(self)
            }
            Value::Null => Ok(self),
            other => Err(LogisError::configuration(format!(
                "parameters for '{}' must be a mapping, got {}",
                self.name, other
            ))),
        }
    }

    /// Fix an input port to a literal value
    pub fn input<K, V>(mut self, port: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.literals.push((port.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<Node> {
        let stage = self.stage.ok_or_else(|| {
            LogisError::construction(format!("node '{}' has no stage", self.name))
        })?;
        let mut node = Node::from_boxed_stage(self.name, stage, self.params);
        for (port, value) in self.literals {
            node.bind_literal(&port, value)?;
        }
        Ok(node)
    }
}

/// Collects nodes and connections, reporting the first failure at `build`
#[derive(Debug)]
pub struct WorkflowBuilder {
    workflow: Workflow,
    error: Option<LogisError>,
}

impl WorkflowBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            workflow: Workflow::new(name),
            error: None,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        if self.error.is_none() {
            if let Err(err) = self.workflow.add_node(node) {
                self.error = Some(err);
            }
        }
        self
    }

    pub fn node_with(self, build: impl FnOnce() -> Result<Node>) -> Self {
        match build() {
            Ok(node) => self.node(node),
            Err(err) => self.fail(err),
        }
    }

    pub fn connect<I, C>(mut self, connections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Connection>,
    {
        if self.error.is_none() {
            if let Err(err) = self.workflow.connect(connections) {
                self.error = Some(err);
            }
        }
        self
    }

    pub fn literal(mut self, node: &str, port: &str, value: impl Into<Value>) -> Self {
        if self.error.is_none() {
            if let Err(err) = self.workflow.set_input(node, port, value) {
                self.error = Some(err);
            }
        }
        self
    }

    fn fail(mut self, err: LogisError) -> Self {
        self.error.get_or_insert(err);
        self
    }

    pub fn build(self) -> Result<Workflow> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.workflow),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::links;
    use crate::stages::tools;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_per_axis_output_node_ports() {
        let node = per_axis_output_node("Outputs", &["gmsurface_file", "wmsurface_file"], &["lh", "rh"]);
        assert_eq!(
            node.output_names(),
            vec![
                "lh_gmsurface_file",
                "lh_wmsurface_file",
                "rh_gmsurface_file",
                "rh_wmsurface_file"
            ]
        );
        assert_eq!(node.input_names(), node.output_names());

        let empty = per_axis_output_node::<&str, &str>("Outputs", &["gmsurface_file"], &[]);
        assert!(empty.outputs().is_empty());
    }

    #[test]
    fn test_node_builder_literals() {
        let node = NodeBuilder::new("GenusZeroImageFilter")
            .stage(tools::genus_zero_image_filter())
            .param("connectivity", 0)
            .input("out_mask", "lh_g0_wm.nii.gz")
            .build()
            .unwrap();
        assert_eq!(node.literals()["out_mask"], Value::String("lh_g0_wm.nii.gz".into()));
        assert_eq!(node.params()["connectivity"], Value::from(0));

        let err = NodeBuilder::new("bad")
            .stage(tools::genus_zero_image_filter())
            .input("no_such_port", 1)
            .build()
            .unwrap_err();
        assert!(err.is_assembly_error());
        assert!(NodeBuilder::new("empty").build().is_err());
    }

    #[test]
    fn test_workflow_builder_reports_first_error() {
        let err = WorkflowBuilder::new("wf")
            .node(identity("Inputs", ["t1_file"]))
            .node(identity("Inputs", ["t2_file"]))
            .connect(links("Inputs", "Missing", &[("t1_file", "x")]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("already has a node"));
    }
}
