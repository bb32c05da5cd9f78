//! Dump changelog command implementation.

use super::{print_records, RecordInfo};
use dsrepl_core::{ChangelogDb, LogConfig, ServerState};
use dsrepl_server::domain_dir_name;
use std::path::Path;
use std::sync::Arc;

/// Runs the dump-changelog command.
pub fn run(
    root: &Path,
    base_dn: &str,
    replica: Option<u16>,
    after: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = read_records(root, base_dn, replica, after, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            println!("Changelog of {} ({} records)", base_dn, records.len());
            println!("================");
            println!();
            print_records(&records);
        }
    }

    Ok(())
}

/// Reads records of `base_dn` in CSN order.
pub fn read_records(
    root: &Path,
    base_dn: &str,
    replica: Option<u16>,
    after: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<RecordInfo>, Box<dyn std::error::Error>> {
    let changelog_path = root.join(domain_dir_name(base_dn)).join("changelog");
    if !changelog_path.is_dir() {
        return Err(format!("No changelog for {} under {:?}", base_dn, root).into());
    }
    let from: ServerState = match after {
        Some(text) => text.parse()?,
        None => ServerState::new(),
    };

    let db = Arc::new(ChangelogDb::open(&changelog_path, LogConfig::default())?);
    let mut cursor = db.cursor(&from);
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();
    while records.len() < max_records {
        let Some(record) = cursor.next()? else {
            break;
        };
        if replica.is_some_and(|id| id != record.csn.replica_id()) {
            continue;
        }
        records.push(RecordInfo::from(&record));
    }
    Ok(records)
}
