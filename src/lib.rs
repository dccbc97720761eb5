pub mod config;
pub mod dialog;
pub mod error;
pub mod generator;
pub mod http;
pub mod output;
pub mod prompt;
pub mod session;
