pub mod config;
pub mod elastic;
pub mod mapping;
