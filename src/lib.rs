pub mod broker;
pub mod cli;
pub mod config;
pub mod console;
pub mod db;
pub mod engine;
pub mod error;
pub mod local;
pub mod models;
pub mod server;
