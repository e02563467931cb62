//! Core types, config, and errors for Easel.

pub mod config;
pub mod error;
pub mod types;
