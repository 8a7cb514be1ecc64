// Crucible - session-aware control plane for a code-generation CLI
// Library exports

pub mod config;
pub mod error;
pub mod evolve;
pub mod gateway;
pub mod registry;
pub mod server;
pub mod session;
