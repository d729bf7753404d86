//! musictool - reconciles a digital music library with a physical record
//! collection into one view of which formats are owned.

pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod normalize;
pub mod overrides;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod release;
pub mod resolver;
pub mod safety;
pub mod scoring;
pub mod sources;
pub mod store;
