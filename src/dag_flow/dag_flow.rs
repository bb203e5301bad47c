//! Workflow graphs: named nodes with declared ports, wired by typed
//! connections.
//!
//! A [`Workflow`] owns its nodes and connections. Every connection is checked
//! when it is added: both ends must exist and declare the port in the right
//! direction, the destination must not already have a producer, and the new
//! edge must not close a cycle. Nested workflows are embedded as nodes and
//! addressed from the parent with dotted ports such as `Inputs.t1_file`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::errors::{LogisError, Result};
use crate::stages::StageInterface;

/// Static configuration record of a node, forwarded verbatim to its stage
pub type ParamRecord = BTreeMap<String, Value>;

/// Values carried on ports, keyed by port name
pub type PortValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// What a port carries. File-valued ports are checked for existence before
/// a stage runs and after it reports its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    File,
    FileList,
    /// Name to path mapping
    FileMap,
    /// Plain scalar such as a subject id or an output filename
    Value,
}

/// A declared slot on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub kind: PortKind,
    pub optional: bool,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::File)
    }

    pub fn file_list(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::FileList)
    }

    pub fn file_map(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::FileMap)
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self::new(name, PortKind::Value)
    }

    /// Mark the port as not required for the node to run
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Records which fan-out axis value a node was instantiated for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisBinding {
    pub axis: String,
    pub value: String,
    /// Template node name before the axis prefix was applied
    pub base_name: String,
}

impl AxisBinding {
    /// Directory component used for this instance, e.g. `_hemisphere_lh`
    pub fn iterable_dir(&self) -> String {
        format!("_{}_{}", self.axis, self.value)
    }
}

/// What a node does when the graph runs
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Relays every input value unchanged to the output of the same name
    Identity,
    /// Invokes an external tool or in-process function
    Stage(Box<dyn StageInterface>),
    /// A nested workflow, addressed through its boundary nodes
    Workflow(Box<Workflow>),
}

/// A named unit in a workflow
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    params: ParamRecord,
    literals: PortValues,
    axis: Option<AxisBinding>,
}

impl Node {
    /// Identity node exposing `fields` as both inputs and outputs
    pub fn identity<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ports: Vec<PortSpec> = fields
            .into_iter()
            .map(|field| PortSpec::value(field).optional())
            .collect();
        Self {
            name: name.into(),
            kind: NodeKind::Identity,
            inputs: ports.clone(),
            outputs: ports,
            params: ParamRecord::new(),
            literals: PortValues::new(),
            axis: None,
        }
    }

    /// Stage node whose ports are taken from the stage's declared spec
    pub fn stage<T>(name: impl Into<String>, stage: T, params: ParamRecord) -> Self
    where
        T: StageInterface + 'static,
    {
        Self::from_boxed_stage(name.into(), Box::new(stage), params)
    }

    pub(crate) fn from_boxed_stage(
        name: String,
        stage: Box<dyn StageInterface>,
        params: ParamRecord,
    ) -> Self {
        Self {
            name,
            inputs: stage.input_spec(),
            outputs: stage.output_spec(),
            kind: NodeKind::Stage(stage),
            params,
            literals: PortValues::new(),
            axis: None,
        }
    }

    /// Embed a workflow; the node takes the workflow's name
    pub fn subgraph(workflow: Workflow) -> Self {
        Self {
            name: workflow.name.clone(),
            kind: NodeKind::Workflow(Box::new(workflow)),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: ParamRecord::new(),
            literals: PortValues::new(),
            axis: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, NodeKind::Identity)
    }

    pub fn as_workflow(&self) -> Option<&Workflow> {
        match &self.kind {
            NodeKind::Workflow(workflow) => Some(workflow),
            _ => None,
        }
    }

    pub fn interface_name(&self) -> &str {
        match &self.kind {
            NodeKind::Identity => "IdentityInterface",
            NodeKind::Stage(stage) => stage.interface_name(),
            NodeKind::Workflow(_) => "Workflow",
        }
    }

    pub fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn input(&self, port: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == port)
    }

    pub fn output(&self, port: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == port)
    }

    pub fn has_input(&self, port: &str) -> bool {
        self.input(port).is_some()
    }

    pub fn has_output(&self, port: &str) -> bool {
        self.output(port).is_some()
    }

    pub fn params(&self) -> &ParamRecord {
        &self.params
    }

    /// Input values fixed when the graph was built
    pub fn literals(&self) -> &PortValues {
        &self.literals
    }

    pub fn axis(&self) -> Option<&AxisBinding> {
        self.axis.as_ref()
    }

    pub(crate) fn bind_literal(&mut self, port: &str, value: Value) -> Result<()> {
        if !self.has_input(port) {
            return Err(LogisError::construction(format!(
                "node '{}' ({}) declares no input port '{}'",
                self.name,
                self.interface_name(),
                port
            )));
        }
        if self.literals.contains_key(port) {
            return Err(LogisError::construction(format!(
                "input '{}.{}' already has a literal value",
                self.name, port
            )));
        }
        self.literals.insert(port.to_string(), value);
        Ok(())
    }

    /// Fresh copy of a template node for one axis value
    pub(crate) fn instantiate(&self, name: String, axis: AxisBinding) -> Node {
        let mut node = self.clone();
        node.name = name;
        node.axis = Some(axis);
        node
    }
}

/// One end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    /// Port name, or `inner_node.port` when `node` is a nested workflow
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// A typed edge `(source node, output port) -> (dest node, input port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub source: PortRef,
    pub dest: PortRef,
}

impl Connection {
    pub fn new(
        source_node: impl Into<String>,
        source_port: impl Into<String>,
        dest_node: impl Into<String>,
        dest_port: impl Into<String>,
    ) -> Self {
        Self {
            source: PortRef::new(source_node, source_port),
            dest: PortRef::new(dest_node, dest_port),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.dest)
    }
}

impl<A, B, C, D> From<(A, B, C, D)> for Connection
where
    A: Into<String>,
    B: Into<String>,
    C: Into<String>,
    D: Into<String>,
{
    fn from((source_node, source_port, dest_node, dest_port): (A, B, C, D)) -> Self {
        Connection::new(source_node, source_port, dest_node, dest_port)
    }
}

/// Connections from one node to another, given as `(source_port, dest_port)` pairs
pub fn links(source: &str, dest: &str, ports: &[(&str, &str)]) -> Vec<Connection> {
    ports
        .iter()
        .map(|(source_port, dest_port)| Connection::new(source, *source_port, dest, *dest_port))
        .collect()
}

/// A named DAG of nodes
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    graph: DiGraph<Node, Connection>,
    node_indices: HashMap<String, NodeIndex>,
    producers: HashMap<PortRef, EdgeIndex>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            producers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node. Names are unique among siblings and may not contain `.`.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if node.name.is_empty() {
            return Err(LogisError::construction("node name cannot be empty"));
        }
        if node.name.contains('.') {
            return Err(LogisError::construction(format!(
                "node name '{}' may not contain '.'",
                node.name
            )));
        }
        if self.node_indices.contains_key(&node.name) {
            return Err(LogisError::construction(format!(
                "workflow '{}' already has a node named '{}'",
                self.name, node.name
            )));
        }
        debug!("{}: adding node {} ({})", self.name, node.name, node.interface_name());
        let name = node.name.clone();
        let index = self.graph.add_node(node);
        self.node_indices.insert(name, index);
        Ok(())
    }

    pub fn add_nodes<I>(&mut self, nodes: I) -> Result<()>
    where
        I: IntoIterator<Item = Node>,
    {
        for node in nodes {
            self.add_node(node)?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node_indices.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.node_indices.get(name).map(|index| &self.graph[*index])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes().map(Node::name).collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Connections in the order they were added
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.graph.edge_indices().map(move |edge| &self.graph[edge])
    }

    pub fn connection_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The connection feeding `dest`, if any
    pub fn producer_of(&self, dest: &PortRef) -> Option<&Connection> {
        self.producers.get(dest).map(|edge| &self.graph[*edge])
    }

    /// Whether an input already receives a value from a connection or a literal
    pub fn is_bound(&self, node: &str, port: &str) -> bool {
        if self.producers.contains_key(&PortRef::new(node, port)) {
            return true;
        }
        match self.node(node) {
            Some(n) => match (&n.kind, port.split_once('.')) {
                (NodeKind::Workflow(inner), Some((head, rest))) => inner.is_bound(head, rest),
                _ => n.literals.contains_key(port),
            },
            None => false,
        }
    }

    /// Number of nodes instantiated for `axis` by the fan-out resolver
    pub fn axis_instances(&self, axis: &str) -> usize {
        self.nodes()
            .filter(|n| n.axis.as_ref().is_some_and(|a| a.axis == axis))
            .count()
    }

    /// Fix an input to a literal value. Dotted ports reach into nested
    /// workflows' boundary nodes.
    pub fn set_input(&mut self, node: &str, port: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let index = self.index_of(node)?;
        if self.producers.contains_key(&PortRef::new(node, port)) {
            return Err(LogisError::construction(format!(
                "input '{node}.{port}' is already connected"
            )));
        }
        let target = &mut self.graph[index];
        match &mut target.kind {
            NodeKind::Workflow(inner) => {
                let (head, rest) = split_address(port)?;
                inner.set_input(head, rest, value)
            }
            _ => target.bind_literal(port, value),
        }
    }

    /// Add connections atomically: either every connection is added or the
    /// workflow is left exactly as it was.
    ///
    /// A nested workflow is a single node in the cycle check. Routing one of
    /// its outputs back into one of its inputs is rejected even when the two
    /// lanes are not connected inside it; wire such lanes through separate
    /// subgraphs.
    pub fn connect<I, C>(&mut self, connections: I) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<Connection>,
    {
        let mut added = Vec::new();
        for connection in connections {
            match self.add_connection(connection.into()) {
                Ok(edge) => added.push(edge),
                Err(err) => {
                    self.rollback(added);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn connect_one(
        &mut self,
        source_node: &str,
        source_port: &str,
        dest_node: &str,
        dest_port: &str,
    ) -> Result<()> {
        self.connect([Connection::new(source_node, source_port, dest_node, dest_port)])
    }

    fn add_connection(&mut self, connection: Connection) -> Result<EdgeIndex> {
        let source = self.check_source(&connection)?;
        let dest = self.check_dest(&connection)?;

        if source == dest || has_path_connecting(&self.graph, dest, source, None) {
            return Err(LogisError::construction_at(
                "connection would create a cycle",
                &connection,
            ));
        }

        let key = connection.dest.clone();
        let edge = self.graph.add_edge(source, dest, connection);
        self.producers.insert(key, edge);
        Ok(edge)
    }

    fn rollback(&mut self, added: Vec<EdgeIndex>) {
        // Newest first: each removed edge is the last one, so no indices move.
        for edge in added.into_iter().rev() {
            if let Some(connection) = self.graph.remove_edge(edge) {
                self.producers.remove(&connection.dest);
            }
        }
    }

    fn check_source(&self, connection: &Connection) -> Result<NodeIndex> {
        let source = &connection.source;
        let index = self
            .node_indices
            .get(&source.node)
            .copied()
            .ok_or_else(|| {
                LogisError::construction_at(
                    format!("unknown source node '{}'", source.node),
                    connection,
                )
            })?;
        let node = &self.graph[index];
        match &node.kind {
            NodeKind::Workflow(inner) => inner
                .resolve_boundary(&source.port, Direction::Output)
                .map_err(|err| LogisError::construction_at(err.to_string(), connection))?,
            _ => {
                if !node.has_output(&source.port) {
                    return Err(LogisError::construction_at(
                        format!(
                            "node '{}' ({}) declares no output port '{}'",
                            node.name,
                            node.interface_name(),
                            source.port
                        ),
                        connection,
                    ));
                }
            }
        }
        Ok(index)
    }

    fn check_dest(&self, connection: &Connection) -> Result<NodeIndex> {
        let dest = &connection.dest;
        let index = self.node_indices.get(&dest.node).copied().ok_or_else(|| {
            LogisError::construction_at(format!("unknown destination node '{}'", dest.node), connection)
        })?;
        if let Some(existing) = self.producer_of(dest) {
            return Err(LogisError::construction_at(
                format!("input '{}' already produced by '{}'", dest, existing.source),
                connection,
            ));
        }
        let node = &self.graph[index];
        match &node.kind {
            NodeKind::Workflow(inner) => inner
                .resolve_boundary(&dest.port, Direction::Input)
                .map_err(|err| LogisError::construction_at(err.to_string(), connection))?,
            _ => {
                if !node.has_input(&dest.port) {
                    return Err(LogisError::construction_at(
                        format!(
                            "node '{}' ({}) declares no input port '{}'",
                            node.name,
                            node.interface_name(),
                            dest.port
                        ),
                        connection,
                    ));
                }
                if node.literals.contains_key(&dest.port) {
                    return Err(LogisError::construction_at(
                        format!("input '{dest}' already has a literal value"),
                        connection,
                    ));
                }
            }
        }
        Ok(index)
    }

    /// Check that `address` (`node.port`, possibly nested) names a port on a
    /// boundary identity node of this workflow.
    pub fn resolve_boundary(&self, address: &str, direction: Direction) -> Result<()> {
        let (head, rest) = split_address(address)?;
        let node = self.node(head).ok_or_else(|| {
            LogisError::construction(format!(
                "workflow '{}' has no node '{}' (address '{}')",
                self.name, head, address
            ))
        })?;
        match &node.kind {
            NodeKind::Workflow(inner) => inner.resolve_boundary(rest, direction),
            NodeKind::Identity => {
                if !node.has_input(rest) {
                    return Err(LogisError::construction(format!(
                        "boundary node '{}.{}' exposes no port '{}'",
                        self.name, head, rest
                    )));
                }
                if direction == Direction::Input && self.is_bound(head, rest) {
                    return Err(LogisError::construction(format!(
                        "boundary input '{}.{}.{}' is already bound inside the workflow",
                        self.name, head, rest
                    )));
                }
                Ok(())
            }
            NodeKind::Stage(_) => Err(LogisError::construction(format!(
                "'{}.{}' is a stage, not a boundary node; only identity nodes expose ports",
                self.name, head
            ))),
        }
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.node_indices.get(name).copied().ok_or_else(|| {
            LogisError::construction(format!("workflow '{}' has no node '{}'", self.name, name))
        })
    }

    /// Node names in an order where every producer precedes its consumers
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            LogisError::construction(format!(
                "workflow '{}' contains a cycle through '{}'",
                self.name,
                self.graph[cycle.node_id()].name
            ))
        })?;
        Ok(order.into_iter().map(|index| self.graph[index].name()).collect())
    }

    /// Check the whole workflow is ready to hand to an engine: acyclic, and
    /// every required stage input bound by a connection or a literal.
    pub fn validate(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(LogisError::construction(format!(
                "workflow '{}' contains a cycle",
                self.name
            )));
        }
        for node in self.nodes() {
            match &node.kind {
                NodeKind::Workflow(inner) => inner.validate()?,
                NodeKind::Stage(_) => {
                    for port in node.inputs.iter().filter(|p| !p.optional) {
                        if !self.is_bound(&node.name, &port.name) {
                            return Err(LogisError::construction(format!(
                                "required input '{}.{}.{}' is not connected",
                                self.name, node.name, port.name
                            )));
                        }
                    }
                }
                NodeKind::Identity => {}
            }
        }
        Ok(())
    }

    /// Inline nested workflows into one flat graph of identity and stage
    /// nodes with qualified names (`Sub.Node`).
    pub fn flatten(&self) -> Result<FlatGraph> {
        let mut flat = FlatGraph::default();
        self.flatten_into(&mut flat, &[self.name.clone()], "")?;

        let mut indices = HashMap::new();
        for (i, node) in flat.nodes.iter().enumerate() {
            indices.insert(node.qualified_name.clone(), i);
        }
        let mut dag = DiGraph::<usize, ()>::new();
        let handles: Vec<NodeIndex> = (0..flat.nodes.len()).map(|i| dag.add_node(i)).collect();
        for edge in &flat.edges {
            dag.add_edge(handles[edge.source], handles[edge.dest], ());
        }
        if is_cyclic_directed(&dag) {
            return Err(LogisError::construction(format!(
                "flattened workflow '{}' contains a cycle",
                self.name
            )));
        }
        Ok(flat)
    }

    fn flatten_into(&self, flat: &mut FlatGraph, scope: &[String], prefix: &str) -> Result<()> {
        for node in self.nodes() {
            match &node.kind {
                NodeKind::Workflow(inner) => {
                    let mut inner_scope = scope.to_vec();
                    match node.axis() {
                        Some(axis) => {
                            inner_scope.push(axis.iterable_dir());
                            inner_scope.push(axis.base_name.clone());
                        }
                        None => inner_scope.push(node.name.clone()),
                    }
                    inner.flatten_into(flat, &inner_scope, &format!("{prefix}{}.", node.name))?;
                }
                _ => flat.nodes.push(FlatNode {
                    qualified_name: format!("{prefix}{}", node.name),
                    scope: scope.to_vec(),
                    node: node.clone(),
                }),
            }
        }

        for connection in self.connections() {
            let (source_node, source_port) = self.endpoint(prefix, &connection.source)?;
            let (dest_node, dest_port) = self.endpoint(prefix, &connection.dest)?;
            let source = flat.position(&source_node)?;
            let dest = flat.position(&dest_node)?;
            flat.edges.push(FlatEdge {
                source,
                source_port,
                dest,
                dest_port,
            });
        }
        Ok(())
    }

    /// Qualified `(node, port)` for a connection end, following dotted
    /// addresses down to the boundary node that actually holds the port.
    fn endpoint(&self, prefix: &str, end: &PortRef) -> Result<(String, String)> {
        let node = self.node(&end.node).ok_or_else(|| {
            LogisError::construction(format!("workflow '{}' has no node '{}'", self.name, end.node))
        })?;
        match &node.kind {
            NodeKind::Workflow(inner) => {
                let (head, rest) = split_address(&end.port)?;
                inner.endpoint(&format!("{prefix}{}.", node.name), &PortRef::new(head, rest))
            }
            _ => Ok((format!("{prefix}{}", node.name), end.port.clone())),
        }
    }

    /// Graphviz rendering of the top-level graph
    pub fn to_dot(&self) -> String {
        let mut dot = format!("digraph \"{}\" {{\n", self.name);
        for node in self.nodes() {
            dot.push_str(&format!(
                "  \"{}\" [label=\"{}\\n({})\"];\n",
                node.name,
                node.name,
                node.interface_name()
            ));
        }
        for connection in self.connections() {
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\" [label=\"{} -> {}\"];\n",
                connection.source.node,
                connection.dest.node,
                connection.source.port,
                connection.dest.port
            ));
        }
        dot.push_str("}\n");
        dot
    }
}

fn split_address(address: &str) -> Result<(&str, &str)> {
    address.split_once('.').ok_or_else(|| {
        LogisError::construction(format!(
            "'{address}' must be addressed as 'node.port' on a nested workflow"
        ))
    })
}

/// A stage or identity node after nested workflows have been inlined
#[derive(Debug, Clone)]
pub struct FlatNode {
    /// Dotted path from the top-level workflow, e.g. `ResampleBAWOutputs.Inputs`
    pub qualified_name: String,
    /// Names of the enclosing workflows, outermost first
    pub scope: Vec<String>,
    pub node: Node,
}

impl FlatNode {
    /// Work directory components relative to an engine's base directory.
    /// Fan-out instances live under their `_axis_value` directory.
    pub fn work_dir_components(&self) -> Vec<String> {
        let mut components = self.scope.clone();
        match self.node.axis() {
            Some(axis) => {
                components.push(axis.iterable_dir());
                components.push(axis.base_name.clone());
            }
            None => components.push(self.node.name().to_string()),
        }
        components
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEdge {
    pub source: usize,
    pub source_port: String,
    pub dest: usize,
    pub dest_port: String,
}

/// Flat view of a workflow handed to an execution engine
#[derive(Debug, Clone, Default)]
pub struct FlatGraph {
    pub nodes: Vec<FlatNode>,
    pub edges: Vec<FlatEdge>,
}

impl FlatGraph {
    fn position(&self, qualified_name: &str) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.qualified_name == qualified_name)
            .ok_or_else(|| LogisError::construction(format!("no flat node '{qualified_name}'")))
    }

    pub fn node(&self, qualified_name: &str) -> Option<&FlatNode> {
        self.nodes.iter().find(|n| n.qualified_name == qualified_name)
    }

    /// Edges leaving node `index`
    pub fn outgoing(&self, index: usize) -> impl Iterator<Item = &FlatEdge> {
        self.edges.iter().filter(move |edge| edge.source == index)
    }

    /// Edges entering node `index`
    pub fn incoming(&self, index: usize) -> impl Iterator<Item = &FlatEdge> {
        self.edges.iter().filter(move |edge| edge.dest == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::tools::{self, ToolSpec};
    use pretty_assertions::assert_eq;

    fn echo_stage(name: &str) -> Node {
        let spec = ToolSpec::new("Echo", "echo")
            .input(PortSpec::file("in_file"), Some("--in"))
            .fixed_output(PortSpec::file("out_file"), "out.txt", Some("--out"));
        Node::stage(name, tools::CommandStage::new(spec), ParamRecord::new())
    }

    fn small_workflow() -> Workflow {
        let mut wf = Workflow::new("wf");
        wf.add_node(Node::identity("Inputs", ["t1_file"])).unwrap();
        wf.add_node(echo_stage("a")).unwrap();
        wf.add_node(echo_stage("b")).unwrap();
        wf.add_node(Node::identity("Outputs", ["result"])).unwrap();
        wf
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut wf = small_workflow();
        let err = wf.add_node(echo_stage("a")).unwrap_err();
        assert!(matches!(err, LogisError::GraphConstruction { .. }));
    }

    #[test]
    fn test_connect_and_order() {
        let mut wf = small_workflow();
        wf.connect([
            ("Inputs", "t1_file", "a", "in_file"),
            ("a", "out_file", "b", "in_file"),
            ("b", "out_file", "Outputs", "result"),
        ])
        .unwrap();
        assert_eq!(wf.connection_count(), 3);
        assert_eq!(wf.topological_order().unwrap(), vec!["Inputs", "a", "b", "Outputs"]);
        wf.validate().unwrap();
    }

    #[test]
    fn test_second_producer_is_atomic_failure() {
        let mut wf = small_workflow();
        wf.connect_one("Inputs", "t1_file", "b", "in_file").unwrap();
        let before: Vec<Connection> = wf.connections().cloned().collect();

        let err = wf
            .connect([
                ("Inputs", "t1_file", "a", "in_file"),
                ("a", "out_file", "b", "in_file"),
            ])
            .unwrap_err();
        match err {
            LogisError::GraphConstruction { connection, .. } => {
                assert_eq!(connection.as_deref(), Some("a.out_file -> b.in_file"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let after: Vec<Connection> = wf.connections().cloned().collect();
        assert_eq!(before, after);
        assert!(!wf.is_bound("a", "in_file"));
    }

    #[test]
    fn test_undeclared_ports_rejected() {
        let mut wf = small_workflow();
        assert!(wf.connect_one("Inputs", "t2_file", "a", "in_file").is_err());
        assert!(wf.connect_one("Inputs", "t1_file", "a", "mask").is_err());
        // direction matters: in_file is not an output of a
        assert!(wf.connect_one("a", "in_file", "b", "in_file").is_err());
        assert!(wf.connect_one("missing", "x", "b", "in_file").is_err());
        assert_eq!(wf.connection_count(), 0);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = small_workflow();
        wf.connect_one("a", "out_file", "b", "in_file").unwrap();
        let err = wf.connect_one("b", "out_file", "a", "in_file").unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(wf.connection_count(), 1);
    }

    #[test]
    fn test_literal_and_connection_conflict() {
        let mut wf = small_workflow();
        wf.set_input("a", "in_file", "/data/t1.nii.gz").unwrap();
        assert!(wf.connect_one("Inputs", "t1_file", "a", "in_file").is_err());
        wf.connect_one("Inputs", "t1_file", "b", "in_file").unwrap();
        assert!(wf.set_input("b", "in_file", "/data/t2.nii.gz").is_err());
    }

    #[test]
    fn test_validate_reports_unbound_input() {
        let wf = small_workflow();
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("in_file"));
    }

    #[test]
    fn test_dotted_subgraph_addressing() {
        let mut inner = Workflow::new("Inner");
        inner.add_node(Node::identity("Inputs", ["volume"])).unwrap();
        inner.add_node(echo_stage("work")).unwrap();
        inner.add_node(Node::identity("Outputs", ["volume"])).unwrap();
        inner
            .connect([
                ("Inputs", "volume", "work", "in_file"),
                ("work", "out_file", "Outputs", "volume"),
            ])
            .unwrap();

        let mut outer = small_workflow();
        outer.add_node(Node::subgraph(inner)).unwrap();
        outer
            .connect([
                ("Inputs", "t1_file", "Inner", "Inputs.volume"),
                ("Inner", "Outputs.volume", "a", "in_file"),
            ])
            .unwrap();

        // stage nodes inside the subgraph are not part of its port surface
        assert!(outer.connect_one("Inner", "work.out_file", "b", "in_file").is_err());
        // the boundary input now has a producer
        assert!(outer.connect_one("Inputs", "t1_file", "Inner", "Inputs.volume").is_err());
        assert!(outer.connect_one("Inputs", "t1_file", "Inner", "Inputs.missing").is_err());

        let flat = outer.flatten().unwrap();
        let names: Vec<&str> = flat.nodes.iter().map(|n| n.qualified_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Inputs", "a", "b", "Outputs", "Inner.Inputs", "Inner.work", "Inner.Outputs"]
        );
        let into_inner = flat
            .edges
            .iter()
            .find(|e| flat.nodes[e.dest].qualified_name == "Inner.Inputs")
            .unwrap();
        assert_eq!(flat.nodes[into_inner.source].qualified_name, "Inputs");
        assert_eq!(into_inner.dest_port, "volume");

        let work = flat.node("Inner.work").unwrap();
        assert_eq!(work.work_dir_components(), vec!["wf", "Inner", "work"]);
    }

    #[test]
    fn test_subgraph_lanes_cannot_feed_each_other() {
        let mut inner = Workflow::new("Inner");
        inner.add_node(Node::identity("Inputs", ["first", "second"])).unwrap();
        inner.add_node(Node::identity("Outputs", ["first", "second"])).unwrap();
        inner
            .connect([
                ("Inputs", "first", "Outputs", "first"),
                ("Inputs", "second", "Outputs", "second"),
            ])
            .unwrap();

        let mut outer = small_workflow();
        outer.add_node(Node::subgraph(inner)).unwrap();
        outer.connect_one("Inner", "Outputs.first", "a", "in_file").unwrap();
        let err = outer
            .connect_one("a", "out_file", "Inner", "Inputs.second")
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert_eq!(outer.connection_count(), 1);
        assert!(!outer.is_bound("Inner", "Inputs.second"));
    }

    #[test]
    fn test_literal_through_subgraph_boundary() {
        let mut inner = Workflow::new("Inner");
        inner.add_node(Node::identity("Inputs", ["reference_file"])).unwrap();
        let mut outer = Workflow::new("outer");
        outer.add_node(Node::subgraph(inner)).unwrap();
        outer
            .set_input("Inner", "Inputs.reference_file", "/data/ref.nii.gz")
            .unwrap();
        assert!(outer.is_bound("Inner", "Inputs.reference_file"));
    }
}
