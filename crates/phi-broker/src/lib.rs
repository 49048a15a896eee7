//! Restricted PHI broker: the only service that talks to the PHI store.
//! Every PHI route requires an HMAC-signed request from the operational API.

pub mod config;
pub mod http;
pub mod metrics;
