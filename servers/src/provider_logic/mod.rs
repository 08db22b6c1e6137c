pub mod config;
pub mod logger;
pub mod model;
pub mod state;
pub mod ws_transport;
pub mod downstream;
pub mod monitor;
