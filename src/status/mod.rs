//! Status sink
//!
//! The manager's live status is a [`StatusSnapshot`] owned by a
//! [`StatusWriter`]. The writer persists it to the status file (throttled),
//! refreshes it in the background, and broadcasts it through an optional
//! [`StatusPublisher`]. Broadcasting is best-effort: failures never reach the
//! controller.

mod publisher;
mod snapshot;
mod writer;

pub use publisher::{HttpStatusPublisher, StatusPublisher, init_publisher};
pub use snapshot::{
    MAX_DOCUMENT_LEN, MAX_ERROR_BLOCK_LEN, MAX_ERROR_ENTRY_LEN, MAX_TEXT_FIELD_LEN, StatusSnapshot,
};
pub use writer::StatusWriter;
