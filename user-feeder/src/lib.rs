pub mod api;
pub mod config;
pub mod csv_source;
pub mod db_source;
pub mod feed;
pub mod metrics_consts;
