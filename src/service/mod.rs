pub mod bootstrap;
pub mod control;
pub mod http;

pub use bootstrap::{ClientExpiry, WorkerBootstrap};
pub use control::ControlHttpApp;
pub use http::GatewayService;
