pub mod agent;
pub mod builtin;
pub mod errors;
pub mod mcp;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod registry;
pub mod service;
pub mod storage;
