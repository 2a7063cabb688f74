//! Profile-driven typed views over address spaces.

pub mod error;
pub mod list;
pub mod typed;
pub mod value;

pub use error::{ObjectError, ObjectResult};
pub use list::{ListIter, ListWalker};
pub use typed::{Context, TypedObject};
pub use value::Value;
