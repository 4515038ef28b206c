#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]

//! Scheduled interest accrual.
//!
//! Each run obtains a Consul Connect identity, dials the store service over
//! mutual TLS, checks it with `PING`, then adds a random non-negative amount
//! to every configured account balance with `INCRBY`.

pub mod accounts;
pub mod config;
pub mod humantime_serde;
pub mod interest;
pub mod job;
pub mod lambda;
pub mod logging;

pub use accounts::AccountId;
pub use config::{AppConfig, ExitPolicy};
pub use interest::{BalanceStore, BatchReport, InterestPolicy};
pub use job::{JobError, JobSettings, RunOutcome, SUCCESS_MESSAGE};
