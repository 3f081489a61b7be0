pub mod config;
pub mod logging;
pub mod oauth_flow;
pub mod registry;
pub mod repository;
pub mod storage;
pub mod sync;
