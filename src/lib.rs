//! ontime-server - reminder scheduling and punctuality tracking for OnTime
//!
//! Computes when each schedule's "start preparing" reminder should fire,
//! keeps an in-process timer per pending reminder, broadcasts daily
//! summaries and tracks how late users arrive.

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod lateness;
pub mod models;
pub mod preparation;
pub mod push;
pub mod reminder;
pub mod scheduler;
pub mod service;
