//! Attachment download tracking
//!
//! Maps an attachment location to its download status and latest progress
//! value. A second request for a location that is already queued or
//! downloading returns the live entry instead of starting another transfer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AttachmentLocation, AttachmentStatus, MessageId};

/// Tracked state of one attachment download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub status: AttachmentStatus,
    pub progress: u8,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRequest {
    /// A new download should be started for this location.
    New,
    /// A download is already queued or in flight; no new transfer starts.
    AlreadyActive(AttachmentStatus),
}

/// Tracks the attachments currently downloading or queued for download.
#[derive(Debug, Default)]
pub struct AttachmentTracker {
    entries: HashMap<AttachmentLocation, DownloadEntry>,
}

impl AttachmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a download request. Deduplicates against an entry that is
    /// already `Queued` or `Downloading`; terminal entries are restarted.
    pub fn request(&mut self, location: AttachmentLocation) -> DownloadRequest {
        if let Some(entry) = self.entries.get(&location) {
            if matches!(
                entry.status,
                AttachmentStatus::Queued | AttachmentStatus::Downloading
            ) {
                debug!("download of {} already {:?}", location, entry.status);
                return DownloadRequest::AlreadyActive(entry.status);
            }
        }

        self.entries.insert(
            location,
            DownloadEntry {
                status: AttachmentStatus::Queued,
                progress: 0,
                requested_at: Utc::now(),
            },
        );
        DownloadRequest::New
    }

    /// Record a progress update, clamped to 0..=100. Only the latest value
    /// is retained. Returns the new status when the first progress report
    /// moves the entry from `Queued` to `Downloading`.
    pub fn set_progress(
        &mut self,
        location: &AttachmentLocation,
        percent: u8,
    ) -> Option<AttachmentStatus> {
        let entry = self.entries.get_mut(location)?;
        entry.progress = percent.min(100);
        if entry.status == AttachmentStatus::Queued && entry.progress > 0 {
            entry.status = AttachmentStatus::Downloading;
            return Some(entry.status);
        }
        None
    }

    /// Record a finished transfer. `saved` tells whether the fetched bytes
    /// could be persisted locally; a failed save is reported as
    /// `FailedToSave`, distinct from a transfer failure.
    pub fn complete(&mut self, location: &AttachmentLocation, saved: bool) -> AttachmentStatus {
        let status = if saved {
            AttachmentStatus::Downloaded
        } else {
            AttachmentStatus::FailedToSave
        };
        if let Some(entry) = self.entries.get_mut(location) {
            entry.status = status;
            if saved {
                entry.progress = 100;
            }
        }
        status
    }

    /// Record a failed transfer.
    pub fn fail(&mut self, location: &AttachmentLocation) -> AttachmentStatus {
        if let Some(entry) = self.entries.get_mut(location) {
            entry.status = AttachmentStatus::Failed;
        }
        AttachmentStatus::Failed
    }

    pub fn status(&self, location: &AttachmentLocation) -> AttachmentStatus {
        self.entries
            .get(location)
            .map(|e| e.status)
            .unwrap_or(AttachmentStatus::NotDownloaded)
    }

    pub fn progress(&self, location: &AttachmentLocation) -> u8 {
        self.entries.get(location).map(|e| e.progress).unwrap_or(0)
    }

    /// Drop all entries belonging to a message removed from the store.
    pub fn forget_message(&mut self, message: MessageId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|location, _| location.message != message);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(message: u64, part: &str) -> AttachmentLocation {
        AttachmentLocation::new(MessageId(message), part)
    }

    #[test]
    fn test_request_dedups_while_active() {
        let mut tracker = AttachmentTracker::new();
        let loc = location(1, "2");

        assert_eq!(tracker.request(loc.clone()), DownloadRequest::New);
        assert_eq!(
            tracker.request(loc.clone()),
            DownloadRequest::AlreadyActive(AttachmentStatus::Queued)
        );

        tracker.set_progress(&loc, 10);
        assert_eq!(
            tracker.request(loc),
            DownloadRequest::AlreadyActive(AttachmentStatus::Downloading)
        );
    }

    #[test]
    fn test_failed_download_can_be_rerequested() {
        let mut tracker = AttachmentTracker::new();
        let loc = location(1, "2");

        tracker.request(loc.clone());
        tracker.fail(&loc);
        assert_eq!(tracker.request(loc.clone()), DownloadRequest::New);
        assert_eq!(tracker.status(&loc), AttachmentStatus::Queued);
    }

    #[test]
    fn test_first_progress_starts_downloading() {
        let mut tracker = AttachmentTracker::new();
        let loc = location(1, "2");
        tracker.request(loc.clone());

        assert_eq!(
            tracker.set_progress(&loc, 5),
            Some(AttachmentStatus::Downloading)
        );
        // Later reports do not re-announce the transition.
        assert_eq!(tracker.set_progress(&loc, 50), None);
        assert_eq!(tracker.progress(&loc), 50);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut tracker = AttachmentTracker::new();
        let loc = location(1, "2");
        tracker.request(loc.clone());

        tracker.set_progress(&loc, 250);
        assert_eq!(tracker.progress(&loc), 100);
    }

    #[test]
    fn test_save_failure_is_distinct_from_transfer_failure() {
        let mut tracker = AttachmentTracker::new();
        let loc = location(1, "2");
        tracker.request(loc.clone());

        assert_eq!(
            tracker.complete(&loc, false),
            AttachmentStatus::FailedToSave
        );
        assert_eq!(tracker.status(&loc), AttachmentStatus::FailedToSave);

        tracker.request(loc.clone());
        assert_eq!(tracker.complete(&loc, true), AttachmentStatus::Downloaded);
        assert_eq!(tracker.progress(&loc), 100);
    }

    #[test]
    fn test_untracked_location_reports_not_downloaded() {
        let tracker = AttachmentTracker::new();
        assert_eq!(
            tracker.status(&location(9, "1")),
            AttachmentStatus::NotDownloaded
        );
        assert_eq!(tracker.progress(&location(9, "1")), 0);
    }

    #[test]
    fn test_forget_message_drops_entries() {
        let mut tracker = AttachmentTracker::new();
        tracker.request(location(1, "2"));
        tracker.request(location(1, "3"));
        tracker.request(location(2, "1"));

        assert_eq!(tracker.forget_message(MessageId(1)), 2);
        assert_eq!(tracker.status(&location(2, "1")), AttachmentStatus::Queued);
    }
}
