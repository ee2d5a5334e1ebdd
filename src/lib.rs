pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod history;
pub mod llms_txt;
pub mod metrics;
pub mod pin;
pub mod rate_limit;
