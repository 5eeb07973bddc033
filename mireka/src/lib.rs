pub mod config;
pub mod context;
pub mod controller;

pub use config::Config;
pub use controller::Mireka;
