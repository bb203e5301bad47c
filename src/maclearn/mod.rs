//! Edge-probability features, tables and classifier training.

pub mod classifier;
pub mod features;
pub mod filters;
pub mod samples;
pub mod table;
pub mod training;
pub mod volume;

pub use classifier::{Classifier, GaussianNb, GaussianNbFactory, ModelFactory};
pub use features::extract_features;
pub use table::{split_by_region, ColumnGroup, FeatureTable, Matter, RegionalTable};
pub use training::{run_training, train, ArtifactKey, ClassifierArtifact, ModelHandle, TrainingOptions};
pub use volume::Volume;
