//! # Varpulis Core
//!
//! Foundational value types shared by the Varpulis streaming engine crates.
//!
//! - [`value`]: runtime values. `Value` is hashable and totally ordered so it
//!   can be used directly as a partition key.
//! - [`types`]: property types used to describe built-in context properties.
//!
//! ```rust
//! use varpulis_core::{PropertyType, Value};
//!
//! let key = Value::from("E1");
//! assert_eq!(key.type_name(), "str");
//! assert!(PropertyType::Str.accepts(&key));
//! ```

pub mod types;
pub mod value;

pub use types::PropertyType;
pub use value::Value;
