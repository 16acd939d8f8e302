//! Data model: chunks, versioned meta files and user profiles

pub mod chunk;
pub mod meta_file;
pub mod user_profile;

pub use chunk::{Chunk, ChunkCodec};
pub use meta_file::{FileKey, MetaChunk, MetaFile, MetaFileVersion};
pub use user_profile::{FileTreeNode, Locations, UserCredentials, UserProfile};
