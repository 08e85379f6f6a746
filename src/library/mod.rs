//! Library Module - Folders and memories over the dual-write data model
//!
//! Every memory lives in two places: the owner-scoped collection, which is
//! authoritative for per-user reads and quota, and the global mirror used for
//! cross-owner queries. The mirror converges eventually; a failed mirror write
//! is logged and left to reconciliation.
//!
//! A memory's `folder_id` is a weak reference. Readers resolve it against the
//! live folders and treat anything dangling or tombstoned as root.

mod folders;
mod memories;

pub use folders::{Folder, FolderDeletion, FolderManager, NewFolder, ReassignReport};
pub use memories::{MemoryLibrary, MemoryRecord, MemoryUpload};

use crate::KeepsakeError;
use mime_guess::mime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media classification, derived from the filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Image,
    Video,
    Audio,
    Document,
}

impl MemoryType {
    pub fn from_filename(filename: &str) -> Self {
        let guessed = mime_guess::from_path(filename).first_or_octet_stream();
        let top = guessed.type_();
        if top == mime::IMAGE {
            MemoryType::Image
        } else if top == mime::VIDEO {
            MemoryType::Video
        } else if top == mime::AUDIO {
            MemoryType::Audio
        } else {
            MemoryType::Document
        }
    }

    /// Whether a memory of this type can stand in as a folder thumbnail
    pub fn is_visual(self) -> bool {
        matches!(self, MemoryType::Image | MemoryType::Video)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Image => "image",
            MemoryType::Video => "video",
            MemoryType::Audio => "audio",
            MemoryType::Document => "document",
        };
        f.write_str(name)
    }
}

/// A multi-step operation stopped after its first durable step. The caller
/// resumes by re-invoking the same operation.
pub(crate) fn interrupted(completed: &[&str], remaining: &[&str], cause: KeepsakeError) -> KeepsakeError {
    tracing::warn!(
        "Interrupted after [{}], remaining [{}]: {}",
        completed.join(", "),
        remaining.join(", "),
        cause
    );
    KeepsakeError::partial(completed.iter().copied(), remaining.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_from_filename() {
        assert_eq!(MemoryType::from_filename("beach.JPG"), MemoryType::Image);
        assert_eq!(MemoryType::from_filename("party.mp4"), MemoryType::Video);
        assert_eq!(MemoryType::from_filename("voice.mp3"), MemoryType::Audio);
        assert_eq!(MemoryType::from_filename("letter.pdf"), MemoryType::Document);
        assert_eq!(MemoryType::from_filename("no_extension"), MemoryType::Document);
    }
}
