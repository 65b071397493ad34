pub mod agent;
pub mod config;
pub mod database;
pub mod llm;
pub mod preprocess;
pub mod runtime;
pub mod server;
pub mod tools;
pub mod transcript;
