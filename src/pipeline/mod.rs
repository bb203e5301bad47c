//! Assembled pipelines: the LOGISMOS-B workflow, its classifier-driven
//! variants and the subject batch runner.

pub mod logismosb;
pub mod maclearn;
pub mod subjects;

pub use logismosb::{create_logb_workflow, select_hemisphere, HemisphereSelection, SideCandidates};
pub use maclearn::{
    create_logismosb_machine_learning_workflow, create_machine_learning_workflow,
    create_workflow_to_mask_white_matter, create_workflow_to_resample_baw_files,
};
pub use subjects::{BatchReport, BatchRunner, CsvSubjectSource, SubjectRecord, SubjectSource};
