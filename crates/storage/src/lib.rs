pub mod error;
pub mod query;
pub mod schema;
pub mod sqlite;
pub mod state;
pub mod store;
pub mod traits;

pub use error::StorageError;
pub use query::{CompiledQuery, JsonPathQueryCompiler, QueryCompiler, QueryParameterError};
pub use sqlite::{SqliteStorage, is_read_only, set_read_only};
pub use state::IdState;
pub use store::{ResourceStore, TypedStore};
pub use traits::*;
