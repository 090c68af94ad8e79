use std::cmp::Reverse;

use ftpsync_core::{Config, DEFAULT_TIME_FORMAT, Metafile};

use super::command::RemoteMetadata;

/// Remote copies worth offering next to the local file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Profiles whose copy is newer than the local file.
    pub newer: Vec<String>,
    /// Every remote copy, newest first; empty when nothing differs.
    pub candidates: Vec<RemoteMetadata>,
}

impl Classification {
    pub fn is_up_to_date(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckChoice {
    Keep,
    Download(String),
    Upload,
}

/// Compares remote copies against `local`. Unless `forced`, copies of the
/// same size are not considered different.
pub fn classify_versions(
    local: &Metafile,
    entries: &[RemoteMetadata],
    forced: bool,
) -> Classification {
    let mut newer = Vec::new();
    let mut differs = false;
    for entry in entries {
        let different_size = entry.metadata.is_different_size_than(local);
        if !forced && !different_size {
            continue;
        }
        if entry.metadata.is_newer_than(local) {
            newer.push(entry.profile.clone());
            differs = true;
        } else if different_size {
            differs = true;
        }
    }
    if !differs {
        return Classification::default();
    }

    let mut candidates = entries.to_vec();
    candidates.sort_by_key(|entry| Reverse(entry.metadata.last_modified()));
    Classification { newer, candidates }
}

/// Rows for the check dialog: keep, one row per candidate, upload.
pub fn check_rows(config: &Config, local: &Metafile, classification: &Classification) -> Vec<Vec<String>> {
    let mut rows = vec![local_row("Keep current", local)];
    for candidate in &classification.candidates {
        let size = match (candidate.metadata.size(), local.size()) {
            (Some(remote), Some(mine)) if remote == mine => "same size".to_string(),
            (Some(remote), Some(mine)) if remote > mine => {
                format!("{} kB ~ larger", kilobytes(remote))
            }
            (Some(remote), _) => format!("{} kB ~ smaller", kilobytes(remote)),
            (None, _) => "unknown size".to_string(),
        };
        let age = if classification.newer.contains(&candidate.profile) {
            "newer"
        } else {
            "older"
        };
        rows.push(vec![
            format!("Get from {} [{}]", candidate.profile, host_of(config, &candidate.profile)),
            format!("Size: {size}"),
            format!("Last modified: {} ~ {age}", formatted_time(&candidate.metadata)),
        ]);
    }
    rows.push(local_row("Upload file", local));
    rows
}

/// Maps a row index of [`check_rows`] back to an action.
pub fn check_choice(classification: &Classification, index: Option<usize>) -> CheckChoice {
    match index {
        Some(0) | None => CheckChoice::Keep,
        Some(index) => match classification.candidates.get(index - 1) {
            Some(candidate) => CheckChoice::Download(candidate.profile.clone()),
            None if index == classification.candidates.len() + 1 => CheckChoice::Upload,
            None => CheckChoice::Keep,
        },
    }
}

/// Remote copies an on-save upload would overwrite although they are newer
/// and of a different size.
pub fn overwrite_conflicts(
    config: &Config,
    local: &Metafile,
    entries: &[RemoteMetadata],
) -> Vec<RemoteMetadata> {
    entries
        .iter()
        .filter(|entry| {
            config.profile(&entry.profile).is_some_and(|profile| {
                profile.upload_on_save && profile.overwrite_newer_prevention
            })
        })
        .filter(|entry| {
            entry.metadata.is_newer_than(local) && entry.metadata.is_different_size_than(local)
        })
        .cloned()
        .collect()
}

/// Yes/no rows asking whether newer remote copies may be overwritten.
pub fn overwrite_rows(config: &Config, conflicts: &[RemoteMetadata]) -> Vec<Vec<String>> {
    let newest = conflicts
        .iter()
        .filter_map(|entry| entry.metadata.last_modified().map(|_| &entry.metadata))
        .max_by_key(|metadata| metadata.last_modified());
    let mut yes = vec![
        "Yes, overwrite newer".to_string(),
        format!(
            "Last modified: {}",
            newest.map(formatted_time).unwrap_or_else(|| "unknown".to_string())
        ),
    ];
    for entry in conflicts {
        yes.push(format!("{} [{}]", entry.profile, host_of(config, &entry.profile)));
    }
    vec![yes, vec!["No".to_string(), "Cancel uploading".to_string()]]
}

fn local_row(label: &str, local: &Metafile) -> Vec<String> {
    vec![
        format!("{label} {}", local.name()),
        format!("Size: {} kB", kilobytes(local.size().unwrap_or_default())),
        format!("Last modified: {}", formatted_time(local)),
    ]
}

fn host_of<'a>(config: &'a Config, profile: &str) -> &'a str {
    config
        .profile(profile)
        .map(|profile| profile.host.as_str())
        .unwrap_or_default()
}

pub(super) fn formatted_time(metadata: &Metafile) -> String {
    metadata
        .last_modified_formatted(DEFAULT_TIME_FORMAT)
        .unwrap_or_else(|| "unknown".to_string())
}

pub(super) fn kilobytes(size: u64) -> String {
    let rounded = (size as f64 / 1024.0 * 1000.0).round() / 1000.0;
    rounded.to_string()
}
