//! Operational client API. PHI never touches this service's database: reads
//! and writes are validated and authorized here, then dispatched to the PHI
//! broker over signed requests.

pub mod broker;
pub mod config;
pub mod directory;
pub mod http;
pub mod metrics;
pub mod orchestrator;

#[cfg(test)]
mod testing;
