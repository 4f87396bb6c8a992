pub mod aggregate;
pub mod auth;
pub mod config;
pub mod export;
pub mod firehose;
pub mod netutil;
pub mod nozzle;
pub mod sink;
