//! Component C: coverage aggregation.
//!
//! `coverage_data` encodes/decodes the shared-memory naming scheme and defines the
//! coverage-data stream item type; `module_proxy` turns one module's raw counters into
//! accumulated features; `module_pool` indexes every live `ModuleProxy` by module
//! identity so a `ProcessProxy` can look one up when a new module connects.

pub mod coverage_data;
pub mod module_pool;
pub mod module_proxy;

pub use coverage_data::CoverageData;
pub use module_pool::ModulePool;
pub use module_proxy::{ModuleId, ModuleProxy};
