//! Ad-creative attribution engine.
//!
//! A run's captured traffic is read ([`capture`]), creatives are flagged
//! ([`classifier`]) and traced back to the ad response that served them
//! ([`correlator`]).  That response is decoded by a per-network decoder
//! ([`decoders`]) into an advertiser id and attribution-partner URLs, and
//! the [`aggregator`] persists the result or a diagnostic.

pub mod aggregator;
pub mod bintree;
pub mod blobs;
pub mod capture;
pub mod cipher;
pub mod classifier;
pub mod correlator;
pub mod db;
pub mod decoders;
pub mod lookups;
pub mod markup;
pub mod phash;
pub mod redirect;
pub mod store;
pub mod tnetstring;
pub mod urls;
