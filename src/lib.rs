//! Kura: a caching front for slow, rate-limited content sources.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
