//! Update resolution: picks the release a polling client should run.

use crate::app_version;
use crate::rollout::{is_in_rollout, is_rollout_incomplete};
use crate::types::Release;
use serde::{Deserialize, Serialize};

/// What a client reports when it polls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateCheckRequest {
    /// Binary version, already normalized to a full semantic version.
    pub app_version: String,
    pub label: Option<String>,
    pub package_hash: Option<String>,
    /// Out-of-band clients (e.g. dev tooling) bypass binary version targeting.
    pub is_companion: bool,
}

impl UpdateCheckRequest {
    /// Whether the client currently runs `release`. Labels are preferred
    /// because package hashes are not unique across a history.
    fn is_running(&self, release: &Release) -> bool {
        match (&self.label, &self.package_hash) {
            (Some(label), _) => *label == release.label,
            (None, Some(hash)) => *hash == release.package_hash,
            (None, None) => false,
        }
    }

    fn has_contents_of(&self, release: &Release) -> bool {
        self.package_hash.as_deref() == Some(release.package_hash.as_str())
            || self.label.as_deref() == Some(release.label.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDecision {
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub description: String,
    pub is_available: bool,
    pub is_mandatory: bool,
    pub app_version: String,
    pub package_hash: String,
    pub label: String,
    pub package_size: u64,
    pub update_app_version: bool,
    pub should_run_binary_version: bool,
}

impl UpdateDecision {
    fn release_tag(&self) -> &str {
        match self.label.is_empty() {
            true => &self.package_hash,
            false => &self.label,
        }
    }
}

/// The precomputed answers for one deployment and query, shared by every
/// client that sends that query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckCacheResponse {
    /// What clients outside the rollout cohort get.
    pub original: UpdateDecision,
    /// What clients inside the rollout cohort get.
    pub rollout: Option<UpdateDecision>,
    pub rollout_percent: Option<u8>,
}

impl UpdateCheckCacheResponse {
    /// Picks the decision for one client. Cohort membership is keyed on the
    /// rollout release's label, so each new release draws a fresh cohort.
    pub fn select(&self, client_id: Option<&str>) -> &UpdateDecision {
        match (&self.rollout, self.rollout_percent, client_id) {
            (Some(rollout), Some(percent), Some(client_id))
                if is_in_rollout(client_id, Some(percent), rollout.release_tag()) =>
            {
                rollout
            }
            _ => &self.original,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RolloutMode {
    Include,
    /// Skip releases whose rollout has not reached 100%.
    SkipIncomplete,
}

/// Accumulator for the newest-to-oldest history scan.
#[derive(Default)]
struct ScanState<'a> {
    /// The release the client runs has been passed.
    found_current_release: bool,
    /// A mandatory release newer than what the client runs was passed.
    should_make_mandatory: bool,
    latest_enabled: Option<&'a Release>,
    latest_satisfying: Option<&'a Release>,
}

impl<'a> ScanState<'a> {
    fn scan(history: &'a [Release], request: &UpdateCheckRequest, mode: RolloutMode) -> Self {
        let mut state = ScanState::default();

        for release in history {
            if !release.is_verified {
                continue;
            }

            state.found_current_release |= request.is_running(release);

            if release.is_disabled
                || (mode == RolloutMode::SkipIncomplete && is_rollout_incomplete(release.rollout))
            {
                continue;
            }

            state.latest_enabled.get_or_insert(release);

            if !request.is_companion
                && !app_version::satisfies(&request.app_version, &release.app_version)
            {
                continue;
            }

            state.latest_satisfying.get_or_insert(release);

            // Everything older than what the client runs is irrelevant.
            if state.found_current_release {
                break;
            }

            if release.is_mandatory {
                state.should_make_mandatory = true;
                break;
            }
        }

        state
    }
}

fn decide<F>(
    history: &[Release],
    request: &UpdateCheckRequest,
    mode: RolloutMode,
    download_url: &F,
) -> (UpdateDecision, Option<u8>)
where
    F: Fn(&Release) -> String,
{
    let mut decision = UpdateDecision::default();

    if !history.iter().any(|r| r.is_verified) {
        decision.should_run_binary_version = true;
        return (decision, None);
    }

    let state = ScanState::scan(history, request, mode);

    let release = match state.latest_satisfying {
        Some(release) if !request.has_contents_of(release) => release,
        _ => {
            if let Some(latest) = state.latest_enabled {
                if app_version::is_newer_than_range(&request.app_version, &latest.app_version) {
                    decision.app_version = latest.app_version.clone();
                } else if !app_version::satisfies(&request.app_version, &latest.app_version) {
                    decision.update_app_version = true;
                    decision.app_version = latest.app_version.clone();
                }
            }
            return (decision, None);
        }
    };

    decision.download_url = download_url(release);
    decision.description = release.description.clone().unwrap_or_default();
    decision.is_available = true;
    decision.is_mandatory = state.should_make_mandatory || release.is_mandatory;
    // Older SDKs compare this against their own version, so it echoes the
    // client's rather than the release's range.
    decision.app_version = request.app_version.clone();
    decision.package_hash = release.package_hash.clone();
    decision.label = release.label.clone();
    decision.package_size = release.size;

    (decision, release.rollout)
}

/// Resolves the update decision(s) for `request` against `history`
/// (newest first). When the selected release is mid-rollout, the decision for
/// clients outside the cohort is computed as well.
pub fn resolve<F>(
    history: &[Release],
    request: &UpdateCheckRequest,
    download_url: F,
) -> UpdateCheckCacheResponse
where
    F: Fn(&Release) -> String,
{
    let (decision, rollout) = decide(history, request, RolloutMode::Include, &download_url);

    if is_rollout_incomplete(rollout) {
        let (original, _) = decide(history, request, RolloutMode::SkipIncomplete, &download_url);
        UpdateCheckCacheResponse {
            original,
            rollout: Some(decision),
            rollout_percent: rollout,
        }
    } else {
        UpdateCheckCacheResponse {
            original: decision,
            rollout: None,
            rollout_percent: None,
        }
    }
}
