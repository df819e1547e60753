//! MemberSync Shared Types and Utilities
//!
//! This crate contains types and utilities shared across the MemberSync job.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
