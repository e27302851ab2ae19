pub mod api;
pub mod collector;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod hardware;
pub mod repo;
pub mod telemetry;
