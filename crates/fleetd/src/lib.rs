pub mod api;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod hub;
pub mod k8s;
pub mod state;
