pub mod redirect;
pub mod tunnel_cli;

pub use tunnel_core::logging::init_tracing;
