pub mod databag;
pub mod path;
pub mod view;

pub use databag::{Databag, DatabagError, JsonDatabag};
pub use path::{Accessor, Path, PathError};
pub use view::{Schema, SchemaError, SimpleSchema, SimpleView, View, ViewError, ViewId};
