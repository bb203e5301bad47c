pub mod branch;
pub mod dag_builder;
pub mod dag_flow;
pub mod executor;
pub mod fanout;

pub use branch::maybe_attach;
pub use dag_builder::{axis_port_name, identity, per_axis_output_node, NodeBuilder, WorkflowBuilder};
pub use dag_flow::*;
pub use executor::{ExecutionReport, LocalExecutor, NodeOutcome, NodeStatus};
pub use fanout::{expand, NodeTemplate, Selection, SelectionFn};
