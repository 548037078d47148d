// src/lib.rs

// Import the top-level `arena` module.
pub mod arena;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use arena::context::ArenaContext;
pub use arena::error::ArenaErrorKind;
pub use arena::model::{Agent, Contest, ContestStatus, FormatPreset, RoundSpec, Side, Turn};
