pub mod analysis;
pub mod bril;
pub mod cfg;
pub mod optimization;
pub mod ssa;
pub mod taint;
