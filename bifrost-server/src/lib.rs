pub mod api;
pub mod config;
pub mod db;
pub mod grpcapi;
pub mod redis;
pub mod result_bus;
pub mod services;
pub mod workflow_lookup;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
