pub mod api;
pub mod app;
pub mod clients;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;
pub mod workers;
