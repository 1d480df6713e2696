pub mod clock;
pub mod config;
pub mod duration;
pub mod models;
pub mod provider;
pub mod storage;
pub mod sync;
