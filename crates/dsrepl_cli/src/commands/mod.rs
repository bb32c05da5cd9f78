//! CLI command implementations.

pub mod dump_changelog;
pub mod ecl;
pub mod inspect_state;
pub mod serve;
pub mod verify;

use dsrepl_core::{read_state_file, ChangeKind, Operation, UpdateRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "server.state";
const CHANGELOG_DIR: &str = "changelog";

/// A domain directory found under the server root.
#[derive(Debug)]
pub struct DomainDir {
    /// Base DN from the state file, or the directory name.
    pub base_dn: String,
    /// Directory path.
    pub path: PathBuf,
}

impl DomainDir {
    /// Path of the persisted server state.
    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    /// Path of the changelog.
    pub fn changelog_path(&self) -> PathBuf {
        self.path.join(CHANGELOG_DIR)
    }
}

/// Lists the domain directories under `root`, sorted by base DN.
pub fn domain_dirs(root: &Path) -> Result<Vec<DomainDir>, Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("No server root found at {:?}", root).into());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        let state_path = path.join(STATE_FILE);
        if !state_path.is_file() && !path.join(CHANGELOG_DIR).is_dir() {
            continue;
        }
        let base_dn = match read_state_file(&state_path) {
            Ok((base_dn, _)) => base_dn,
            Err(_) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        dirs.push(DomainDir { base_dn, path });
    }
    dirs.sort_by(|a, b| a.base_dn.cmp(&b.base_dn));
    Ok(dirs)
}

/// Changelog record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// CSN string form.
    pub csn: String,
    /// Originating replica.
    pub replica_id: u16,
    /// Milliseconds since the epoch at generation.
    pub time: u64,
    /// Changed entry.
    pub entry_dn: String,
    /// Operation name.
    pub operation: &'static str,
    /// Attribute changes, one line per change.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    /// Caller correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<&UpdateRecord> for RecordInfo {
    fn from(record: &UpdateRecord) -> Self {
        Self {
            csn: record.csn.to_string(),
            replica_id: record.csn.replica_id(),
            time: record.csn.time(),
            entry_dn: record.entry_dn.clone(),
            operation: record.operation.name(),
            changes: describe_changes(&record.operation),
            correlation_id: record.correlation_id.map(|id| id.to_string()),
        }
    }
}

fn describe_changes(operation: &Operation) -> Vec<String> {
    let join = |values: &[dsrepl_core::AttributeValue]| {
        values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match operation {
        Operation::Add { attributes } => attributes
            .iter()
            .map(|(name, values)| format!("{}: {}", name, join(values)))
            .collect(),
        Operation::Modify { changes } => changes
            .iter()
            .map(|change| {
                let kind = match change.kind {
                    ChangeKind::Add => "add",
                    ChangeKind::Delete => "delete",
                    ChangeKind::Replace => "replace",
                };
                format!("{} {}: {}", kind, change.attribute, join(&change.values))
            })
            .collect(),
        Operation::Delete => Vec::new(),
        Operation::ModifyDn {
            new_rdn,
            new_superior,
            delete_old_rdn,
        } => {
            let mut out = vec![format!("newrdn: {}", new_rdn)];
            if let Some(superior) = new_superior {
                out.push(format!("newsuperior: {}", superior));
            }
            out.push(format!("deleteoldrdn: {}", delete_old_rdn));
            out
        }
    }
}

/// Prints records as a listing, one line per record plus its changes.
pub fn print_records(records: &[RecordInfo]) {
    for record in records {
        print!(
            "{} {:8} {}",
            record.csn, record.operation, record.entry_dn
        );
        if let Some(ref id) = record.correlation_id {
            print!(" [{}]", id);
        }
        println!();
        for change in &record.changes {
            println!("    {}", change);
        }
    }
}
