//! Types shared by the adscan crates: configuration, captured exchanges,
//! attribution records and the error taxonomy.

pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod record;
