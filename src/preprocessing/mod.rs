//! Per-source cleaning of the raw DVF and BNB tables

pub mod bnb;
pub mod dvf;
pub mod geo;

pub use bnb::BuildingSource;
pub use dvf::{
    deduplicate_mutations, DropComplexDuplicates, DuplicateResolver, Deduplicated, Transaction,
};
pub use geo::GeoArea;
