use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Payload key carrying an image locator between stages.
pub const KEY_IMAGE_URI: &str = "KEY_IMAGE_URI";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub image: Option<String>,
    pub blur_level: u32,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub stage_delay: Duration,
    pub blur_sigma: f32,
    pub history_limit: usize,
    pub device: DeviceState,
}

/// Opaque image locator. Either a `file://` URI or a plain filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Parse a locator; empty or whitespace-only input means "no image".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            None
        } else {
            Some(Self(s.to_string()))
        }
    }

    /// Build a `file://` locator from an absolute path.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        url::Url::from_file_path(path)
            .ok()
            .map(|u| Self(u.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to a local path. Non-file URI schemes are rejected.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        match url::Url::parse(&self.0) {
            Ok(u) if u.scheme() == "file" => u.to_file_path().ok(),
            // Single-letter "schemes" are Windows drive letters.
            Ok(u) if u.scheme().len() > 1 => None,
            _ => Some(PathBuf::from(&self.0)),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// String key/value payload handed from one stage to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkData(BTreeMap<String, String>);

impl WorkData {
    pub fn with_string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `upstream` on top of this payload; upstream values win on key clashes.
    pub fn merged_with(&self, upstream: &WorkData) -> WorkData {
        let mut merged = self.0.clone();
        merged.extend(upstream.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        WorkData(merged)
    }

    /// The image locator carried under [`KEY_IMAGE_URI`], if non-empty.
    pub fn image_uri(&self) -> Option<ImageRef> {
        self.get_string(KEY_IMAGE_URI).and_then(ImageRef::parse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Cleanup,
    Blur,
    Save,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Cancelled
        )
    }
}

/// Device conditions that stage constraints are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub charging: bool,
    pub storage_low: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            charging: true,
            storage_low: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub requires_charging: bool,
    pub requires_storage_not_low: bool,
}

impl Constraints {
    pub fn satisfied_by(&self, device: &DeviceState) -> bool {
        (!self.requires_charging || device.charging)
            && (!self.requires_storage_not_low || !device.storage_low)
    }

    /// Human-readable list of unmet conditions, for status lines.
    pub fn unmet(&self, device: &DeviceState) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.requires_charging && !device.charging {
            out.push("charging");
        }
        if self.requires_storage_not_low && device.storage_low {
            out.push("storage not low");
        }
        out
    }
}

/// Scheduler-assigned chain identity. Monotonically increasing per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Observable record of one stage, as delivered in status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub id: String,
    pub chain: ChainId,
    pub kind: StageKind,
    pub status: StageStatus,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub output: WorkData,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_utc: Option<String>,
    #[serde(default)]
    pub finished_utc: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Current time formatted the same way everywhere in snapshots.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_locator_means_no_image() {
        assert_eq!(ImageRef::parse(""), None);
        assert_eq!(ImageRef::parse("   "), None);
        assert_eq!(
            ImageRef::parse("file:///a.jpg").map(|r| r.to_string()),
            Some("file:///a.jpg".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn locators_resolve_to_paths() {
        let uri = ImageRef::parse("file:///tmp/a.jpg").unwrap();
        assert_eq!(uri.to_file_path(), Some(PathBuf::from("/tmp/a.jpg")));

        let bare = ImageRef::parse("/tmp/b.png").unwrap();
        assert_eq!(bare.to_file_path(), Some(PathBuf::from("/tmp/b.png")));

        let remote = ImageRef::parse("https://example.com/c.png").unwrap();
        assert_eq!(remote.to_file_path(), None);

        let back = ImageRef::from_path(std::path::Path::new("/tmp/d e.png")).unwrap();
        assert_eq!(back.as_str(), "file:///tmp/d%20e.png");
        assert_eq!(back.to_file_path(), Some(PathBuf::from("/tmp/d e.png")));
    }

    #[test]
    fn upstream_output_overrides_own_input() {
        let own = WorkData::default()
            .with_string(KEY_IMAGE_URI, "file:///own.png")
            .with_string("extra", "kept");
        let upstream = WorkData::default().with_string(KEY_IMAGE_URI, "file:///prev.png");

        let merged = own.merged_with(&upstream);
        assert_eq!(merged.get_string(KEY_IMAGE_URI), Some("file:///prev.png"));
        assert_eq!(merged.get_string("extra"), Some("kept"));

        let merged = own.merged_with(&WorkData::default());
        assert_eq!(merged.get_string(KEY_IMAGE_URI), Some("file:///own.png"));
    }

    #[test]
    fn constraints_against_device_state() {
        let c = Constraints {
            requires_charging: true,
            requires_storage_not_low: true,
        };
        assert!(c.satisfied_by(&DeviceState::default()));

        let unplugged = DeviceState {
            charging: false,
            storage_low: true,
        };
        assert!(!c.satisfied_by(&unplugged));
        assert_eq!(c.unmet(&unplugged), vec!["charging", "storage not low"]);
        assert!(Constraints::default().satisfied_by(&unplugged));
    }
}
