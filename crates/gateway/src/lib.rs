pub mod config;
pub mod http;
pub mod metrics;
pub mod permission_cache;
pub mod rate_limit;
pub mod storage;
