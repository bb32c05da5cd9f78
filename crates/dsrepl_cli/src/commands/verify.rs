//! Verify command implementation.

use super::domain_dirs;
use dsrepl_core::{read_state_file, verify_segment, Csn, UpdateRecord};
use std::path::{Path, PathBuf};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of records checked.
    pub records_checked: usize,
    /// Number of state files checked.
    pub states_checked: usize,
    /// Problems that recovery repairs on open.
    pub warnings: Vec<String>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying server root at {:?}", root);
    println!();

    let result = verify_root(root)?;
    println!("Segments checked: {}", result.segments_checked);
    println!("Records checked:  {}", result.records_checked);
    println!("State files:      {}", result.states_checked);
    for warning in &result.warnings {
        println!("  warning: {}", warning);
    }
    for error in &result.errors {
        println!("  error: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every domain under `root`.
pub fn verify_root(root: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();

    for dir in domain_dirs(root)? {
        let state_path = dir.state_path();
        if state_path.is_file() {
            result.states_checked += 1;
            match read_state_file(&state_path) {
                Ok((base_dn, _)) => {
                    let dir_name = dir.path.file_name().map(|n| n.to_string_lossy().into_owned());
                    if dir_name.as_deref() != Some(dsrepl_server::domain_dir_name(&base_dn).as_str()) {
                        result.errors.push(format!(
                            "{}: state file names domain {} but lives in {:?}",
                            state_path.display(),
                            base_dn,
                            dir.path
                        ));
                    }
                }
                Err(err) => result
                    .errors
                    .push(format!("{}: {}", state_path.display(), err)),
            }
        }

        let changelog = dir.changelog_path();
        if !changelog.is_dir() {
            continue;
        }
        for replica_dir in sorted_entries(&changelog, |path| path.is_dir())? {
            verify_replica_log(&replica_dir, &mut result)?;
        }
    }

    Ok(result)
}

fn verify_replica_log(dir: &Path, result: &mut VerifyResult) -> Result<(), Box<dyn std::error::Error>> {
    // sealed names are hex CSN ranges, so they sort before head.log
    let segments = sorted_entries(dir, |path| {
        path.extension().is_some_and(|ext| ext == "log")
    })?;
    let mut last: Option<Csn> = None;

    for path in segments {
        result.segments_checked += 1;
        let report = match verify_segment::<UpdateRecord>(&path) {
            Ok(report) => report,
            Err(err) => {
                result.errors.push(format!("{}: {}", path.display(), err));
                continue;
            }
        };
        result.records_checked += report.info.records;

        if report.torn_bytes > 0 {
            let message = format!(
                "{}: {} bytes after the last complete record",
                path.display(),
                report.torn_bytes
            );
            if report.info.sealed {
                result.errors.push(message);
            } else {
                result.warnings.push(message);
            }
        }

        if let (Some(prev), Some(first)) = (last, report.info.first_key) {
            if first <= prev {
                result.errors.push(format!(
                    "{}: starts at {} which does not follow {}",
                    path.display(),
                    first,
                    prev
                ));
            }
        }
        if report.info.last_key.is_some() {
            last = report.info.last_key;
        }
    }
    Ok(())
}

fn sorted_entries(
    dir: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
