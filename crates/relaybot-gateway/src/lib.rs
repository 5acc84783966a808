pub mod bootstrap;
pub mod relay;
pub mod server;

pub use bootstrap::{build_provider, build_runtime, build_tools};
pub use relay::Relay;
pub use server::GatewayServer;
