//! Tracking quality as reported by the upstream visual tracker.

use serde::{Deserialize, Serialize};

/// Confidence of the visual tracker, mirrored onto every published pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingQuality {
    /// No visual tracking (session not started, or tracking lost).
    Unavailable,
    /// Tracking, but with reduced confidence (fast motion, low texture, ...).
    Limited,
    /// Tracking normally.
    Normal,
    /// Tracking with extra confidence (e.g. depth-aided relocalization).
    High,
}

impl Default for TrackingQuality {
    fn default() -> Self {
        Self::Unavailable
    }
}

impl TrackingQuality {
    /// Whether poses at this quality should drive point extraction.
    pub fn is_usable(self) -> bool {
        self >= TrackingQuality::Limited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_ordering() {
        assert!(TrackingQuality::High > TrackingQuality::Normal);
        assert!(TrackingQuality::Normal > TrackingQuality::Limited);
        assert!(!TrackingQuality::Unavailable.is_usable());
        assert!(TrackingQuality::Limited.is_usable());
    }
}
