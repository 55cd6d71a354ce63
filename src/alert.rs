//! This module defines the alerts the storage engine sends to the torrent
//! control loop.
//!
//! Communication of such alerts is performed via an unbounded
//! [tokio::sync::mpsc] channel, so they can be posted from the primary thread
//! as well as from the preallocation worker without blocking either. The
//! control loop owns the receiving end and reacts to them: it refreshes its
//! statistics, updates the peer-wire `have` state or reports a failed
//! preallocation to the user.
//!
//! A dropped receiver is not an error, the engine keeps working silently.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::ChunkIndex;

/// The channel on which alerts are sent.
pub type AlertSender = UnboundedSender<Alert>;
/// The channel the control loop listens on.
pub type AlertReceiver = UnboundedReceiver<Alert>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The chunks in the inclusive range are no longer downloaded.
    ChunksExcluded { from: ChunkIndex, to: ChunkIndex },
    /// The chunks in the inclusive range are wanted again.
    ChunksIncluded { from: ChunkIndex, to: ChunkIndex },
    /// Aggregate statistics such as bytes left have changed.
    UpdateStats,
    /// A chunk believed to be on disk failed its hash check and was reset.
    ChunkCorrupted(ChunkIndex),
    /// The preallocation worker is done.
    PreallocationFinished {
        /// The storage error that aborted the walk, if any.
        error: Option<String>,
        /// False if the walk was stopped before every file was extended.
        completed: bool,
    },
}

/// Posts the alert if someone is listening.
pub(crate) fn post(tx: Option<&AlertSender>, alert: Alert) {
    if let Some(tx) = tx {
        if tx.send(alert).is_err() {
            log::trace!("Alert receiver dropped, discarding alert");
        }
    }
}
