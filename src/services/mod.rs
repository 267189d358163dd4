//! Collaborator services consumed through narrow interfaces.

pub mod artifacts;
pub mod memory;

pub use artifacts::{ArtifactKey, ArtifactService};
pub use memory::{MemoryEntry, MemoryService, SearchMemoryRequest, SearchMemoryResponse};
