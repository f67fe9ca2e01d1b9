mod cv_utils;
mod routes;
mod telemetry;

pub mod app;
pub mod batch;
pub mod capture;
pub mod config;
pub mod detector;
pub mod frame;
pub mod pipeline;
pub mod server;
pub mod stream;

pub use app::start_app;
