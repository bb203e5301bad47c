//! Conditional sub-assembly of optional branches

use tracing::debug;

use super::dag_flow::Workflow;
use crate::core::errors::{LogisError, Result};

/// Run `build` against a copy of the workflow when `enabled`, keeping the
/// result only if the branch just appended nodes and connections.
/// Returns whether the branch was attached.
pub fn maybe_attach<F>(workflow: &mut Workflow, enabled: bool, branch: &str, build: F) -> Result<bool>
where
    F: FnOnce(&mut Workflow) -> Result<()>,
{
    if !enabled {
        debug!("{}: branch '{}' disabled", workflow.name(), branch);
        return Ok(false);
    }
    let mut staged = workflow.clone();
    build(&mut staged)?;
    verify_append_only(workflow, &staged)
        .map_err(|err| LogisError::construction(format!("branch '{branch}': {err}")))?;
    debug!(
        "{}: branch '{}' added {} node(s), {} connection(s)",
        workflow.name(),
        branch,
        staged.node_count() - workflow.node_count(),
        staged.connection_count() - workflow.connection_count()
    );
    *workflow = staged;
    Ok(true)
}

/// Check `after` only extends `before`: same nodes, same literals and the
/// original connections as a prefix.
pub fn verify_append_only(before: &Workflow, after: &Workflow) -> Result<()> {
    for node in before.nodes() {
        let Some(kept) = after.node(node.name()) else {
            return Err(LogisError::construction(format!("node '{}' was removed", node.name())));
        };
        if kept.interface_name() != node.interface_name() || kept.literals() != node.literals() {
            return Err(LogisError::construction(format!(
                "existing node '{}' was modified",
                node.name()
            )));
        }
        if let (Some(old), Some(new)) = (node.as_workflow(), kept.as_workflow()) {
            verify_append_only(old, new)?;
            if new.node_count() != old.node_count() || new.connection_count() != old.connection_count() {
                return Err(LogisError::construction(format!(
                    "nested workflow '{}' was modified",
                    node.name()
                )));
            }
        }
    }
    let mut after_connections = after.connections();
    for connection in before.connections() {
        if after_connections.next() != Some(connection) {
            return Err(LogisError::construction_at(
                "existing connection was removed or reordered",
                connection,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_flow::Node;

    fn base() -> Workflow {
        let mut wf = Workflow::new("wf");
        wf.add_node(Node::identity("Inputs", ["subject_id"])).unwrap();
        wf.add_node(Node::identity("Outputs", ["subject_id"])).unwrap();
        wf.connect_one("Inputs", "subject_id", "Outputs", "subject_id").unwrap();
        wf
    }

    #[test]
    fn test_disabled_branch_is_noop() {
        let mut wf = base();
        let attached = maybe_attach(&mut wf, false, "sink", |_| {
            panic!("builder must not run")
        })
        .unwrap();
        assert!(!attached);
        assert_eq!(wf.node_count(), 2);
    }

    #[test]
    fn test_enabled_branch_appends() {
        let mut wf = base();
        let attached = maybe_attach(&mut wf, true, "sink", |wf| {
            wf.add_node(Node::identity("Extra", ["subject_id"]))?;
            wf.connect_one("Inputs", "subject_id", "Extra", "subject_id")
        })
        .unwrap();
        assert!(attached);
        assert_eq!(wf.node_count(), 3);
        assert_eq!(wf.connection_count(), 2);
    }

    #[test]
    fn test_mutating_branch_rejected() {
        let mut wf = base();
        let err = maybe_attach(&mut wf, true, "bad", |wf| wf.set_input("Inputs", "subject_id", "0131"))
            .unwrap_err();
        assert!(err.to_string().contains("modified"));
        assert!(wf.node("Inputs").unwrap().literals().is_empty());
    }

    #[test]
    fn test_failing_builder_leaves_workflow() {
        let mut wf = base();
        let result = maybe_attach(&mut wf, true, "broken", |wf| {
            wf.add_node(Node::identity("Extra", ["x"]))?;
            wf.connect_one("Extra", "missing", "Outputs", "subject_id")
        });
        assert!(result.is_err());
        assert!(!wf.contains("Extra"));
    }
}
