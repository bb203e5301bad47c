//! Fan-out: replicate a template sub-graph once per axis value.
//!
//! Every instance is a fresh copy of the template nodes named
//! `{value}_{base}`. A selection function, which must be a plain `fn`,
//! decides the axis-specific bindings of each instance. Terminal outputs
//! are wired into the per-axis output node on port `{value}_{output}`.

use serde_json::Value;
use tracing::debug;

use super::dag_builder::axis_port_name;
use super::dag_flow::{AxisBinding, Connection, Node, PortRef, Workflow};
use crate::core::errors::{LogisError, Result};

/// An axis-specific binding onto a template node's input
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Feed `node.port` from an existing node of the parent workflow
    Connect {
        source: PortRef,
        node: String,
        port: String,
    },
    /// Fix `node.port` to a value
    Literal {
        node: String,
        port: String,
        value: Value,
    },
}

impl Selection {
    pub fn connect(source: PortRef, node: &str, port: &str) -> Self {
        Selection::Connect {
            source,
            node: node.to_string(),
            port: port.to_string(),
        }
    }

    pub fn literal(node: &str, port: &str, value: impl Into<Value>) -> Self {
        Selection::Literal {
            node: node.to_string(),
            port: port.to_string(),
            value: value.into(),
        }
    }
}

/// Pure mapping from an axis value and the shared inputs to bindings
pub type SelectionFn<T> = fn(&str, &T) -> Result<Vec<Selection>>;

/// Nodes replicated per axis value, with their wiring
#[derive(Debug, Clone, Default)]
pub struct NodeTemplate {
    nodes: Vec<Node>,
    internal: Vec<Connection>,
    shared: Vec<Connection>,
    terminals: Vec<(String, String, String)>,
}

impl NodeTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connections between template nodes, by base name
    pub fn connect<I, C>(mut self, connections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Connection>,
    {
        self.internal.extend(connections.into_iter().map(Into::into));
        self
    }

    /// Connections from nodes of the parent workflow into template nodes
    pub fn shared<I, C>(mut self, connections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Connection>,
    {
        self.shared.extend(connections.into_iter().map(Into::into));
        self
    }

    /// Route `node.port` to the aggregator port `{value}_{output}`
    pub fn terminal(mut self, node: &str, port: &str, output: &str) -> Self {
        self.terminals
            .push((node.to_string(), port.to_string(), output.to_string()));
        self
    }

    pub fn contains(&self, base_name: &str) -> bool {
        self.nodes.iter().any(|n| n.name() == base_name)
    }

    pub fn base_names(&self) -> Vec<&str> {
        self.nodes.iter().map(Node::name).collect()
    }

    /// Base names of the outputs the aggregator must expose
    pub fn output_bases(&self) -> Vec<&str> {
        self.terminals.iter().map(|(_, _, base)| base.as_str()).collect()
    }
}

/// Instantiate `template` once per value of `axis`. The workflow is only
/// modified when every instance was wired successfully.
pub fn expand<S, T>(
    workflow: &mut Workflow,
    axis: &str,
    axis_values: &[S],
    shared_inputs: &T,
    selection: SelectionFn<T>,
    template: &NodeTemplate,
    aggregator: &str,
) -> Result<()>
where
    S: AsRef<str>,
{
    if !axis_values.is_empty() && !template.terminals.is_empty() && !workflow.contains(aggregator) {
        return Err(LogisError::construction(format!(
            "fan-out over '{axis}' needs aggregator node '{aggregator}'"
        )));
    }

    let mut staged = workflow.clone();
    for value in axis_values {
        let value = value.as_ref();
        let rename = |base: &str| {
            if template.contains(base) {
                axis_port_name(value, base)
            } else {
                base.to_string()
            }
        };

        for node in &template.nodes {
            staged.add_node(node.instantiate(
                axis_port_name(value, node.name()),
                AxisBinding {
                    axis: axis.to_string(),
                    value: value.to_string(),
                    base_name: node.name().to_string(),
                },
            ))?;
        }

        staged.connect(template.internal.iter().map(|c| {
            Connection::new(rename(&c.source.node), &c.source.port, rename(&c.dest.node), &c.dest.port)
        }))?;

        staged.connect(template.shared.iter().map(|c| Connection {
            source: c.source.clone(),
            dest: PortRef::new(rename(&c.dest.node), &c.dest.port),
        }))?;

        for chosen in selection(value, shared_inputs)? {
            let target = match &chosen {
                Selection::Connect { node, .. } | Selection::Literal { node, .. } => node,
            };
            if !template.contains(target) {
                return Err(LogisError::construction(format!(
                    "selection for {axis}={value} targets '{target}', which is not a template node"
                )));
            }
            match chosen {
                Selection::Connect { source, node, port } => {
                    staged.connect([Connection {
                        source,
                        dest: PortRef::new(rename(&node), port),
                    }])?;
                }
                Selection::Literal { node, port, value } => {
                    staged.set_input(&rename(&node), &port, value)?;
                }
            }
        }

        staged.connect(template.terminals.iter().map(|(node, port, output)| {
            Connection::new(rename(node), port, aggregator, axis_port_name(value, output))
        }))?;
        debug!("{}: instantiated {}={}", staged.name(), axis, value);
    }

    *workflow = staged;
    Ok(())
}
