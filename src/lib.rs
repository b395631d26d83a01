//! Application layer over `fgui-core`: the [`Coordinator`] that owns every
//! server connection and collection synchronizer, and the on-disk state they
//! are built from.

pub mod coordinator;
pub mod persistence;

pub use coordinator::{AppEvent, Coordinator};
pub use persistence::{load_state, save_state, PersistedState};
