//! Transport abstraction between a Switchyard client and the configuration
//! service.
//!
//! This crate defines the wire records and the [`Transport`] trait, plus an
//! in-memory service for tests and local development.

pub mod memory;
pub mod provider;

pub use memory::MemoryTransport;
pub use provider::{
    Declaration, DeclarationAck, RuleRecord, RulesFetch, RulesQuery, SettingRecord, Transport,
};
