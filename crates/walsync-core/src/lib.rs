pub mod error;
pub mod position;
pub mod state;
pub mod table;
pub mod types;

pub use error::{Error, Result};
pub use position::Position;
pub use state::ReplicationState;
pub use table::{TableRef, TableSet};
pub use types::{Change, ChangeKind, RowMap, Value};
