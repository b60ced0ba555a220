pub mod agent;
pub mod ai_sdk;
pub mod bridge;
pub mod catalog;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod tools;
