//! Ready-made plugins.
//!
//! | Plugin                    | Purpose                                        |
//! |---------------------------|------------------------------------------------|
//! | [`LoggingPlugin`]         | log every hook at a fixed `tracing` level      |
//! | [`DisallowRestartPlugin`] | let a store run only once                      |
//! | [`UndoRedoPlugin`]        | capped linear undo/redo history of commands    |

mod disallow_restart;
mod logging;
mod undo_redo;

pub use disallow_restart::{DisallowRestartPlugin, DISALLOW_RESTART_PLUGIN_NAME};
pub use logging::{LoggingPlugin, LOGGING_PLUGIN_NAME};
pub use undo_redo::{UndoRedoPlugin, Undoable, UNDO_REDO_PLUGIN_NAME};
