pub mod api;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod resolver;
pub mod session;
