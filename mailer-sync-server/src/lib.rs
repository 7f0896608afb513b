pub mod auth;
pub mod handlers;
pub mod server;
pub mod settings;
mod tracer;

pub use settings::Settings;
pub use tracer::init_logs;
