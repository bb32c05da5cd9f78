//! Inspect state command implementation.

use super::domain_dirs;
use dsrepl_core::{normalize_dn, read_state_file, verify_segment, Csn, ServerState, UpdateRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Persisted state of one domain.
#[derive(Debug, Serialize)]
pub struct DomainState {
    /// Base DN.
    pub base_dn: String,
    /// Domain directory.
    pub path: String,
    /// Newest CSN per replica.
    pub replicas: Vec<ReplicaState>,
    /// Error reading the state file, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Newest CSN of one replica, with its changelog segments.
#[derive(Debug, Serialize)]
pub struct ReplicaState {
    /// Replica id.
    pub replica_id: u16,
    /// Newest CSN recorded in the state file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csn: Option<String>,
    /// Changelog segments (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentSummary>>,
}

/// One changelog segment.
#[derive(Debug, Serialize)]
pub struct SegmentSummary {
    /// File name.
    pub file: String,
    /// Number of records.
    pub records: usize,
    /// First CSN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    /// Last CSN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    /// Size in bytes.
    pub bytes: u64,
}

/// Runs the inspect-state command.
pub fn run(
    root: &Path,
    base_dn: Option<&str>,
    show_segments: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let states = collect(root, base_dn, show_segments)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        _ => print_text_output(&states),
    }
    Ok(())
}

/// Reads the state of every matching domain under `root`.
pub fn collect(
    root: &Path,
    base_dn: Option<&str>,
    show_segments: bool,
) -> Result<Vec<DomainState>, Box<dyn std::error::Error>> {
    let wanted = base_dn.map(normalize_dn);
    let mut states = Vec::new();

    for dir in domain_dirs(root)? {
        if wanted.as_ref().is_some_and(|w| *w != dir.base_dn) {
            continue;
        }
        let mut domain = DomainState {
            base_dn: dir.base_dn.clone(),
            path: dir.path.display().to_string(),
            replicas: Vec::new(),
            error: None,
        };

        let mut replica_ids = BTreeSet::new();
        let state_path = dir.state_path();
        let state = if state_path.is_file() {
            match read_state_file(&state_path) {
                Ok((_, state)) => state,
                Err(err) => {
                    domain.error = Some(err.to_string());
                    ServerState::new()
                }
            }
        } else {
            ServerState::new()
        };
        replica_ids.extend(state.replica_ids());
        if show_segments {
            replica_ids.extend(changelog_replicas(&dir.changelog_path())?);
        }

        for replica_id in replica_ids {
            let segments = if show_segments {
                Some(segment_summaries(&dir.changelog_path().join(replica_id.to_string()))?)
            } else {
                None
            };
            domain.replicas.push(ReplicaState {
                replica_id,
                csn: state.max_csn(replica_id).map(|csn| csn.to_string()),
                segments,
            });
        }
        states.push(domain);
    }

    if let Some(wanted) = wanted {
        if states.is_empty() {
            return Err(format!("No domain {} under {:?}", wanted, root).into());
        }
    }
    Ok(states)
}

fn changelog_replicas(dir: &Path) -> Result<Vec<u16>, Box<dyn std::error::Error>> {
    let mut ids = Vec::new();
    if !dir.is_dir() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(id) = entry.file_name().to_string_lossy().parse::<u16>() {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn segment_summaries(dir: &Path) -> Result<Vec<SegmentSummary>, Box<dyn std::error::Error>> {
    let mut summaries = Vec::new();
    if !dir.is_dir() {
        return Ok(summaries);
    }
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect();
    paths.sort();
    for path in paths {
        let report = verify_segment::<UpdateRecord>(&path)?;
        let csn = |key: Option<Csn>| key.map(|csn| csn.to_string());
        summaries.push(SegmentSummary {
            file: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            records: report.info.records,
            first: csn(report.info.first_key),
            last: csn(report.info.last_key),
            bytes: report.info.bytes,
        });
    }
    Ok(summaries)
}

fn print_text_output(states: &[DomainState]) {
    for domain in states {
        println!("Domain {}", domain.base_dn);
        println!("================");
        println!("  Path: {}", domain.path);
        if let Some(ref error) = domain.error {
            println!("  State file: {}", error);
        }
        for replica in &domain.replicas {
            println!(
                "  Replica {:5}  {}",
                replica.replica_id,
                replica.csn.as_deref().unwrap_or("-")
            );
            for segment in replica.segments.iter().flatten() {
                println!(
                    "    {}  {} records, {} bytes",
                    segment.file, segment.records, segment.bytes
                );
            }
        }
        println!();
    }
}
