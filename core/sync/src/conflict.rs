//! Three-way conflict detection.
//!
//! A path is described by three digests: the local content, the content
//! at the last successful sync (the marker), and the remote content. The
//! marker tells which side moved since the last sync.

use serde::{Deserialize, Serialize};

use anchorsync_common::Digest;

use crate::state::{ConflictKind, SyncAction, Transfer};

/// The three observations for one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreeWay {
    /// Local digest, `None` for a tombstone or a path never stored locally.
    pub local: Option<Digest>,
    /// Digest at the last successful sync.
    pub marker: Option<Digest>,
    /// Remote digest, `None` if the remote has no such file.
    pub remote: Option<Digest>,
    /// Whether local state exists for the path (a tombstone counts).
    pub tracked: bool,
}

impl ThreeWay {
    /// Classify the path.
    ///
    /// Deletions are treated asymmetrically: a remote deletion of content
    /// that local still holds unchanged is pulled, while a local deletion
    /// only pushes when the remote still holds exactly what was synced.
    pub fn classify(&self) -> SyncAction {
        let ThreeWay {
            local,
            marker,
            remote,
            tracked,
        } = *self;

        if local == remote {
            return SyncAction::Noop;
        }

        match (local, remote) {
            (Some(local), Some(remote)) => {
                if marker == Some(local) {
                    SyncAction::Pull(Transfer::Copy)
                } else if marker == Some(remote) {
                    SyncAction::Push(Transfer::Copy)
                } else {
                    SyncAction::Conflict(ConflictKind::BothModified)
                }
            }
            (Some(local), None) => match marker {
                // Never synced.
                None => SyncAction::Push(Transfer::Copy),
                Some(marker) if marker == local => SyncAction::Pull(Transfer::Remove),
                Some(_) => SyncAction::Conflict(ConflictKind::DeletedRemotely),
            },
            (None, Some(remote)) => {
                if !tracked && marker.is_none() {
                    // New remote file.
                    SyncAction::Pull(Transfer::Copy)
                } else if marker == Some(remote) {
                    SyncAction::Push(Transfer::Remove)
                } else {
                    SyncAction::Conflict(ConflictKind::DeletedLocally)
                }
            }
            (None, None) => SyncAction::Noop,
        }
    }
}

/// Classify a path from its three digests.
pub fn classify(
    local: Option<Digest>,
    marker: Option<Digest>,
    remote: Option<Digest>,
    tracked: bool,
) -> SyncAction {
    ThreeWay {
        local,
        marker,
        remote,
        tracked,
    }
    .classify()
}
