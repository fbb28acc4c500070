//! Data application gateway: resolves published services by path and runs
//! them against the virtual query engine or a registered backend.

pub mod authorizer;
pub mod cache;
pub mod config;
pub mod config_center;
pub mod engine;
pub mod filter;
pub mod grade_label;
pub mod http;
pub mod metrics;
pub mod permission;
pub mod proxy;
pub mod rate_limit;
pub mod recorder;
pub mod upstream;
