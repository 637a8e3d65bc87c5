pub mod base;
pub mod config;
pub mod errors;
pub mod models;
pub mod pool;
pub mod reactor;
pub mod trace;
pub mod transport;
