//! Data model shared by the client core and the server.

mod edit;
mod fold;
mod record;

pub use edit::{Edit, OpKind, ValidationError};
pub use fold::{apply_edit, fold};
pub use record::{EntityKind, Fields, Record, RecordId};
