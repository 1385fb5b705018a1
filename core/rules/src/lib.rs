//! Settings, rule stores and the context matcher.
//!
//! A [`Setting`] holds an atomically swappable [`RuleStore`]; lookups resolve
//! against whatever store is installed, without taking locks.

pub mod context;
pub mod registry;
pub mod rule;
pub mod setting;
pub mod store;

pub use context::{ContextDefaults, ContextResolver, DefaultSource};
pub use registry::Registry;
pub use rule::{Conditions, Rule, RuleSource};
pub use setting::{CoerceHook, CoercionEvent, Setting, SettingBuilder, Validator};
pub use store::{merge_context, RuleStore};
