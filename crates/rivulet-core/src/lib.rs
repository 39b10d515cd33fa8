//! # Rivulet Core
//!
//! Data types shared by every rivulet component:
//!
//! - [`value`]: dynamically typed field values
//! - [`record`]: the tuples exchanged between sources, operators and sinks
//!
//! ```rust
//! use rivulet_core::{Record, Value};
//!
//! let record = Record::new().with_field("id", 1i64).with_field("zone", "north");
//! assert_eq!(record.get("id"), Some(&Value::Int(1)));
//! ```

pub mod record;
pub mod value;

pub use record::{FxIndexMap, Record, SharedRecord, TOPIC_META};
pub use value::Value;
