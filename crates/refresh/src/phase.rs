//! The four ordered synchronization phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One synchronization step of a refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stores,
    Products,
    Stocks,
    MonthlySales,
}

impl Phase {
    /// Execution order. A run never skips or re-enters a phase.
    pub const ALL: [Phase; 4] = [
        Phase::Stores,
        Phase::Products,
        Phase::Stocks,
        Phase::MonthlySales,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stores => "stores",
            Phase::Products => "products",
            Phase::Stocks => "stocks",
            Phase::MonthlySales => "monthly_sales",
        }
    }

    /// Phase that follows this one, `None` after monthly sales.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Stores => Some(Phase::Products),
            Phase::Products => Some(Phase::Stocks),
            Phase::Stocks => Some(Phase::MonthlySales),
            Phase::MonthlySales => None,
        }
    }

    /// Name of the external entry point that performs this phase.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Phase::Stores => "sync_stores",
            Phase::Products => "load_products",
            Phase::Stocks => "sync_stocks",
            Phase::MonthlySales => "sync_all_monthly_sales",
        }
    }

    /// Dashboard progress (percent) reported when the phase begins.
    pub fn progress_at_start(&self) -> u8 {
        match self {
            Phase::Stores => 5,
            Phase::Products => 30,
            Phase::Stocks => 55,
            Phase::MonthlySales => 80,
        }
    }

    /// Dashboard progress (percent) once the phase has finished.
    pub fn progress_at_end(&self) -> u8 {
        self.next().map(|p| p.progress_at_start()).unwrap_or(100)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
