pub mod cluster;
pub mod config;
pub mod controller;
pub mod model;
pub mod server;
