//! Dataset assembly, encoding, external layers and feature selection

pub mod build;
pub mod dummies;
pub mod external;
pub mod feature_selection;
pub mod split;
pub mod statistics;
pub mod trend;

pub use build::{merge_sources, prepare_dataset, NumericFilter, PrepareConfig, TargetVar};
pub use dummies::{
    encode_categoricals, get_categorical_vars, get_most_frequent_levels, prepare_dummies,
    to_dummies, MAX_CATEGORY_LEVELS,
};
pub use feature_selection::{select_above_threshold, Threshold};
pub use split::{modeling_table, temporal_train_test_split, TemporalSplit};
pub use statistics::{summarize_dataset, DatasetSummary};
