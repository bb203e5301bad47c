pub mod action;
pub mod function;
pub mod maclearn;
pub mod sink;
pub mod tools;

pub use action::{InputOrigin, StageCtx, StageInterface};
pub use function::FunctionStage;
pub use maclearn::{CollectFeatureFiles, CreateReferenceImage, PredictEdgeProbability};
pub use sink::{DataSink, SinkSubstitutions};
pub use tools::{CommandStage, ToolSpec};
