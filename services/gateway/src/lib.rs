//! Portico gateway library.
//!
//! A path-prefix reverse proxy whose routes are health-checked by TCP
//! probing and compiled into a dispatch table that is swapped atomically
//! whenever routes change.

pub mod api;
pub mod config;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod repository;
pub mod route;
pub mod routing;
pub mod server;
pub mod state;
