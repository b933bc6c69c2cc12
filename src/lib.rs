// src/lib.rs

//! Realm Sync Library
//!
//! Crawls a game world's public API and reconciles characters, guilds and realms into a
//! local store with a change history.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod storage;
pub mod utils;

pub use error::{AppError, Result};
pub use pipeline::Engine;
