pub mod config;
pub mod cu;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod isa;
pub mod kernel;
pub mod memory;
pub mod metrics;
pub mod port;
pub mod protocol;
pub mod resource;
pub mod wavefront;
