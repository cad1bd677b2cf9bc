//! Module for taint analysis
pub mod taint_analysis;

// Re-export analyze function
pub use taint_analysis::analyze;
