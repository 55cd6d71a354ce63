use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Download priority of a chunk or a file.
///
/// The declaration order is the eagerness order, so the derived `Ord` can be
/// used to pick the most eager of several priorities:
///
/// ```text
/// FirstPreview > First > NormalPreview > Normal > LastPreview > Last > OnlySeed > Excluded
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    /// Never downloaded, and the backing storage may be dropped.
    Excluded,
    /// Kept for seeding if present, never downloaded.
    OnlySeed,
    Last,
    LastPreview,
    #[default]
    Normal,
    NormalPreview,
    First,
    FirstPreview,
}

impl Priority {
    /// Whether a chunk with this priority should be downloaded at all.
    pub fn is_wanted(self) -> bool {
        !matches!(self, Self::Excluded | Self::OnlySeed)
    }

    pub fn is_preview(self) -> bool {
        matches!(
            self,
            Self::FirstPreview | Self::NormalPreview | Self::LastPreview
        )
    }

    /// Returns the preview tier matching this priority. Priorities without a
    /// preview tier are returned unchanged.
    pub fn to_preview(self) -> Self {
        match self {
            Self::First => Self::FirstPreview,
            Self::Normal => Self::NormalPreview,
            Self::Last => Self::LastPreview,
            other => other,
        }
    }

    /// The numeric code stored in the persisted priority record.
    pub fn code(self) -> u8 {
        match self {
            Self::Excluded => 10,
            Self::OnlySeed => 20,
            Self::Last => 30,
            Self::LastPreview => 35,
            Self::Normal => 40,
            Self::NormalPreview => 45,
            Self::First => 50,
            Self::FirstPreview => 55,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let prio = match code {
            10 => Self::Excluded,
            20 => Self::OnlySeed,
            30 => Self::Last,
            35 => Self::LastPreview,
            40 => Self::Normal,
            45 => Self::NormalPreview,
            50 => Self::First,
            55 => Self::FirstPreview,
            _ => return None,
        };
        Some(prio)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excluded => "excluded",
            Self::OnlySeed => "only seed",
            Self::Last => "last",
            Self::LastPreview => "last (preview)",
            Self::Normal => "normal",
            Self::NormalPreview => "normal (preview)",
            Self::First => "first",
            Self::FirstPreview => "first (preview)",
        };
        f.write_str(s)
    }
}
