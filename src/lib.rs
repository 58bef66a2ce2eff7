//! Approval workflow engine for financial transactions
//!
//! Transactions above risk or value thresholds are routed through a
//! configurable multi-level human sign-off: rules decide how many levels and
//! which roles, an append-only action ledger records every decision, and all
//! status changes commit through a compare-and-swap on
//! `(status, current_level)` so concurrent approvers and maintenance sweeps
//! never clobber each other.

pub mod analytics;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod maintenance;
pub mod notify;
pub mod risk;
pub mod rule;
pub mod service;
mod store;
pub mod utils;
pub mod workflow;
