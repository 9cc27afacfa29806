pub mod agents;
pub mod sessions;
pub mod tail;
pub mod undo;
