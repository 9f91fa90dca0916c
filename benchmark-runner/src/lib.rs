pub mod backend;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod reclaim;
pub mod report;
pub mod timing;
