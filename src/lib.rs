pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod uploader;
