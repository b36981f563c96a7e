pub mod app;
pub mod backend;
pub mod config;
pub mod connspec;
pub mod decode;
pub mod error;
pub mod registry;
pub mod route;
pub mod sink;
pub mod web;
