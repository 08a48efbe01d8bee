pub mod config;
pub mod errors;
pub mod events;
pub mod generation;
pub mod models;
