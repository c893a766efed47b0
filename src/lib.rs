//! focus-sync - Self-hosted sync server for a focus timer
//!
//! Keeps one timer session per account consistent across every connected
//! device and resets the daily session counter at a configured local time.

pub mod api;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod hub;
pub mod models;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod session;
