//! External changelog command implementation.

use super::{print_records, RecordInfo};
use dsrepl_protocol::{format_cookie, parse_cookie};
use dsrepl_server::{ReplicationServer, ServerConfig};
use serde::Serialize;
use std::path::Path;

/// One external changelog entry.
#[derive(Debug, Serialize)]
pub struct EclEntry {
    /// Domain of the change.
    pub base_dn: String,
    /// The change.
    #[serde(flatten)]
    pub record: RecordInfo,
}

/// Records read from the external changelog plus the resume cookie.
#[derive(Debug, Serialize)]
pub struct EclPage {
    /// Records in (CSN, base DN) order.
    pub entries: Vec<EclEntry>,
    /// Cookie resuming after the last entry.
    pub cookie: String,
}

/// Runs the ecl command.
pub fn run(
    root: &Path,
    cookie: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let page = read_page(root, cookie, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        _ => {
            println!("External changelog ({} records)", page.entries.len());
            println!("================");
            println!();
            let mut current: Option<&str> = None;
            for entry in &page.entries {
                if current != Some(entry.base_dn.as_str()) {
                    println!("[{}]", entry.base_dn);
                    current = Some(entry.base_dn.as_str());
                }
                print_records(std::slice::from_ref(&entry.record));
            }
            println!();
            println!("Cookie: {}", page.cookie);
        }
    }
    Ok(())
}

/// Reads up to `limit` records after `cookie`.
pub fn read_page(
    root: &Path,
    cookie: Option<&str>,
    limit: Option<usize>,
) -> Result<EclPage, Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("No server root found at {:?}", root).into());
    }
    let server = ReplicationServer::open(ServerConfig::new(1, root))?;
    let cookie = parse_cookie(cookie.unwrap_or(""))?;
    let mut cursor = server.open_ecl(&cookie)?;

    let mut entries = Vec::new();
    let max_records = limit.unwrap_or(usize::MAX);
    while entries.len() < max_records {
        let Some(next) = cursor.next() else {
            break;
        };
        entries.push(EclEntry {
            record: RecordInfo::from(&next.record),
            base_dn: next.base_dn,
        });
    }
    for base_dn in cursor.degraded_domains() {
        tracing::warn!(base_dn = %base_dn, "domain left out of the external changelog");
    }

    Ok(EclPage {
        entries,
        cookie: format_cookie(cursor.cookie()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsrepl_core::{Csn, Operation};
    use dsrepl_server::SubmitRequest;
    use tempfile::tempdir;

    #[test]
    fn pages_through_domains_with_cookie() {
        let dir = tempdir().unwrap();
        {
            let server = ReplicationServer::open(ServerConfig::new(1, dir.path())).unwrap();
            for (base, t) in [("o=a", 1_000), ("o=b", 2_000), ("o=a", 3_000)] {
                server
                    .submit(SubmitRequest::remote(
                        base,
                        format!("cn=x,{base}"),
                        Operation::Delete,
                        Csn::new(t, 0, 2),
                    ))
                    .unwrap();
            }
            server.flush().unwrap();
        }

        let first = read_page(dir.path(), None, Some(2)).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].base_dn, "o=a");
        assert_eq!(first.entries[1].base_dn, "o=b");

        let rest = read_page(dir.path(), Some(&first.cookie), None).unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].record.time, 3_000);

        assert!(read_page(dir.path(), Some("o=unknown:"), None).is_err());
    }
}
