//! Generic declarative reconciliation engine: descriptor tables drive the
//! diff, the planner owns backend grammar, the executor owns application and
//! reporting. Per-kind knowledge lives in `crate::resources`.

pub mod descriptor;
pub mod diff;
pub mod execute;
pub mod plan;
pub mod reconcile;
pub mod state;
