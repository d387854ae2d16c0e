// src/lib.rs

//! Web-archive indexing pipeline

pub mod error;
pub mod lock;
pub mod models;
pub mod pipeline;
pub mod rules;
pub mod services;
pub mod storage;
pub mod strategy;
pub mod utils;
