//! HTTP surface and process entry points for the Korona refresh pipeline.

pub mod api;
pub mod auth;
pub mod cli;
pub mod router;
pub mod startup;
pub mod state;

pub use router::build_router;
pub use state::AppState;
