pub mod cache;
pub mod calibration;
pub mod clock;
pub mod confidence_bands;
pub mod config;
pub mod context;
pub mod dynamic_calibration;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod isotonic;
pub mod logging;
pub mod monitor;
pub mod poisson;
pub mod store;
