//! Merges credit-card and digital-wallet transactions into one ledger, and lets an untrusted
//! external step edit that ledger without seeing real amounts.
//!
//! The stages are: normalize and merge records ([`merge`]), render the ledger ([`ledger`]), mask
//! its amounts ([`mask`]), hand it to a [`transform`], check the result ([`reconcile`]) and
//! restore the amounts. [`pipeline`] runs them in order.

pub mod args;
pub mod commands;
mod config;
mod error;
pub mod ledger;
pub mod mask;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod rules;
pub mod store;
pub mod transform;
mod utils;


pub use config::{Config, TransformConfig};
pub use error::{Error, ErrorType, Result};
pub use transform::Mode;
