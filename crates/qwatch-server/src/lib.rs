//! Daemon wiring for the rule alerting core: configuration, rule seeding and
//! JSON-lines metric ingestion.

pub mod config;
pub mod ingest;
pub mod rule_seed;
