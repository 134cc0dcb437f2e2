pub mod cache;
pub mod config;
pub mod engine;
pub mod journal;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod wal;
pub mod waitlist;
