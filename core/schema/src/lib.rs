//! Type system for Switchyard settings.
//!
//! Defines the value domains a setting can declare, their wire names, and the
//! partial-coercion rules applied to raw server values.

pub mod setting_type;
pub mod typed;
pub mod value;

pub use setting_type::{Conversion, Primitive, SettingType};
pub use typed::{FromValue, Typed};
pub use value::Value;
