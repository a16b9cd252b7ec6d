use crate::types::{Release, ReleaseMethod};

/// A verified, enabled release labelled `v{n}`.
pub fn release(n: u64, app_version: &str, package_hash: &str) -> Release {
    Release {
        id: n,
        deployment_id: 1,
        label: format!("v{n}"),
        app_version: app_version.into(),
        package_hash: package_hash.into(),
        size: 1024 * n,
        blob_key: format!("blob/v{n}"),
        description: Some(format!("release {n}")),
        is_disabled: false,
        is_mandatory: false,
        rollout: None,
        release_method: ReleaseMethod::Upload,
        is_verified: true,
        original_label: None,
        original_deployment_name: None,
        created_by: None,
        created_at: n,
        updated_at: n,
    }
}
