//! Deterministic rollout cohort selection.
//!
//! A client lands in the same bucket for as long as the release tag stays the
//! same, across polls and process restarts. A new tag reshuffles the cohort.

const DELIMITER: &str = "-";

/// 32-bit string hash (`h = h * 31 + unit`) over UTF-16 code units with
/// wrapping signed arithmetic. Other implementations of this service compute
/// the same value, so the bucket a client lands in never depends on which one
/// served it.
fn hash_code(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

fn bucket_of(hash: i32) -> u8 {
    (i64::from(hash).abs() % 100) as u8
}

/// Bucket in `0..100` for a client and release tag.
pub fn bucket(client_id: &str, release_tag: &str) -> u8 {
    let identifier = format!("{client_id}{DELIMITER}{release_tag}");
    bucket_of(hash_code(&identifier))
}

/// Whether `client_id` is part of a rollout of `percent` for `release_tag`.
/// An absent percentage means the release is not gated.
pub fn is_in_rollout(client_id: &str, percent: Option<u8>, release_tag: &str) -> bool {
    match percent {
        None => true,
        Some(percent) => bucket(client_id, release_tag) < percent,
    }
}

pub fn is_rollout_incomplete(percent: Option<u8>) -> bool {
    matches!(percent, Some(p) if p != 100)
}
