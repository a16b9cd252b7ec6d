use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type AppId = u64;
pub type PlatformId = u64;
pub type DeploymentId = u64;
pub type ReleaseId = u64;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformName {
    Ios,
    Android,
}

impl PlatformName {
    pub const ALL: [PlatformName; 2] = [PlatformName::Ios, PlatformName::Android];

    pub const fn as_str(&self) -> &'static str {
        match self {
            PlatformName::Ios => "ios",
            PlatformName::Android => "android",
        }
    }
}

impl fmt::Display for PlatformName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ios" => Ok(PlatformName::Ios),
            "android" => Ok(PlatformName::Android),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Collaborator permission tiers. Declaration order is the privilege order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Viewer,
    Developer,
    Admin,
    Owner,
}

impl Permission {
    pub fn allows(self, required: Permission) -> bool {
        self >= required
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Viewer => "viewer",
            Permission::Developer => "developer",
            Permission::Admin => "admin",
            Permission::Owner => "owner",
        };
        f.write_str(s)
    }
}

/// The authenticated caller of an operator action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Actor {
            user_id: user_id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: PlatformId,
    pub app_id: AppId,
    pub name: PlatformName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub app_id: AppId,
    pub user_id: String,
    pub permission: Permission,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub platform_id: PlatformId,
    pub name: String,
    pub key: String,
    pub created_at: u64,
}

/// A deployment joined with the app and platform it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub name: String,
    pub key: String,
    pub app_id: AppId,
    pub app_name: String,
    pub platform: PlatformName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMethod {
    Upload,
    Promote,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub deployment_id: DeploymentId,
    pub label: String,
    /// Semantic version range of the binaries this bundle targets.
    pub app_version: String,
    pub package_hash: String,
    pub size: u64,
    pub blob_key: String,
    pub description: Option<String>,
    pub is_disabled: bool,
    pub is_mandatory: bool,
    /// Percentage of clients eligible, `None` when not gated.
    pub rollout: Option<u8>,
    pub release_method: ReleaseMethod,
    pub is_verified: bool,
    pub original_label: Option<String>,
    pub original_deployment_name: Option<String>,
    pub created_by: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Release {
    /// Numeric part of a `v<N>` label.
    pub fn label_number(&self) -> Option<u64> {
        label_number(&self.label)
    }
}

pub fn label_number(label: &str) -> Option<u64> {
    label.strip_prefix('v')?.parse().ok()
}

/// Label following the highest `v<N>` in `releases`, `v1` for an empty history.
pub fn next_label<'a>(releases: impl IntoIterator<Item = &'a Release>) -> String {
    let max = releases
        .into_iter()
        .filter_map(Release::label_number)
        .max()
        .unwrap_or(0);
    format!("v{}", max + 1)
}

/// Insert payload for a release row. The store assigns id and timestamps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRelease {
    pub deployment_id: DeploymentId,
    pub label: String,
    pub app_version: String,
    pub package_hash: String,
    pub size: u64,
    pub blob_key: String,
    pub description: Option<String>,
    pub is_disabled: bool,
    pub is_mandatory: bool,
    pub rollout: Option<u8>,
    pub release_method: ReleaseMethod,
    pub original_label: Option<String>,
    pub original_deployment_name: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCounter {
    Active,
    Installed,
    Downloaded,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub active: u64,
    pub installed: u64,
    pub downloaded: u64,
    pub failed: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Metrics {
    /// Adds `delta` to `counter`, clamping at zero.
    pub fn apply(&mut self, counter: MetricCounter, delta: i64) {
        let value = match counter {
            MetricCounter::Active => &mut self.active,
            MetricCounter::Installed => &mut self.installed,
            MetricCounter::Downloaded => &mut self.downloaded,
            MetricCounter::Failed => &mut self.failed,
        };
        *value = value.saturating_add_signed(delta);
    }
}

/// Net change to one release's counters, applied as a single upsert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricDelta {
    pub release_id: ReleaseId,
    pub active: i64,
    pub installed: i64,
    pub downloaded: i64,
    pub failed: i64,
}

impl MetricDelta {
    pub fn new(release_id: ReleaseId) -> Self {
        MetricDelta {
            release_id,
            ..Default::default()
        }
    }

    pub fn add(&mut self, counter: MetricCounter, delta: i64) {
        match counter {
            MetricCounter::Active => self.active += delta,
            MetricCounter::Installed => self.installed += delta,
            MetricCounter::Downloaded => self.downloaded += delta,
            MetricCounter::Failed => self.failed += delta,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.active == 0 && self.installed == 0 && self.downloaded == 0 && self.failed == 0
    }

    pub fn changes(&self) -> [(MetricCounter, i64); 4] {
        [
            (MetricCounter::Active, self.active),
            (MetricCounter::Installed, self.installed),
            (MetricCounter::Downloaded, self.downloaded),
            (MetricCounter::Failed, self.failed),
        ]
    }
}
