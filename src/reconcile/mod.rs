//! Policy reconciliation
//!
//! The four-phase driver and the batch report it produces.

mod driver;
mod report;

pub use driver::ReconciliationDriver;
pub use report::SuccessCriterion;
