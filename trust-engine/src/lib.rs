pub mod api;
pub mod audit;
pub mod cache;
pub mod config;
pub mod engine;
pub mod flag_definitions;
pub mod flag_matching;
pub mod ids;
pub mod memory_store;
pub mod overrides;
pub mod pg_store;
pub mod session_guard;
pub mod store;
pub mod test_utils;
