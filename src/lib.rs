// Core infrastructure modules
pub mod core;

// Graph model, fan-out, branches and the local engine
pub mod dag_flow;
// Units of work behind stage nodes
pub mod stages;
// Edge-probability features and classifier training
pub mod maclearn;
// Assembled LOGISMOS-B workflows
pub mod pipeline;

// Re-exports for convenience
pub use crate::core::config::PipelineConfig;
pub use crate::core::errors::{LogisError, Result};
pub use dag_flow::{ExecutionReport, LocalExecutor, NodeStatus, Workflow};
pub use pipeline::{create_logb_workflow, BatchRunner};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::tests::SAMPLE_YAML;

    #[test]
    fn test_assembled_pipeline_renders() {
        let config = PipelineConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        let workflow = create_logb_workflow(&config).unwrap();
        let dot = workflow.to_dot();
        assert!(dot.contains("lh_LOGISMOSB"));
        assert!(dot.contains("rh_ctx_thickness"));
        assert!(workflow.topological_order().unwrap().len() == workflow.node_count());
    }
}
