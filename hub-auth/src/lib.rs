//! hub-auth: authentication, session and identity federation core for Hub.

pub mod config;
pub mod db;
pub mod dtos;
pub mod federation;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;
