#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cluster;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod meta;
pub mod migrator;
pub mod resources;
pub mod rollover;
pub mod sequence;
pub mod stats;
pub mod storage;
