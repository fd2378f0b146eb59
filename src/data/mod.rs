//! Frame helpers, file I/O, feature catalog and transaction history

pub mod catalog;
pub mod csv_loader;
pub mod frame;
pub mod history;
pub mod utils;

// Re-export commonly used types
pub use catalog::{Dataset, FeatureCatalog, FeatureGroup};
pub use csv_loader::{read_csv, read_parquet, read_table, write_csv, write_parquet};
pub use history::{
    find_closest, history_file_name, return_close_properties, Comparable, TransactionHistory,
};
