//! The replicated update record stored in the changelog.

use crate::changelog::LogRecord;
use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One replicated change: who changed which entry, how, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// CSN assigned by the originating replica.
    pub csn: Csn,
    /// DN of the modified entry, as given by the originator.
    pub entry_dn: String,
    /// The change itself.
    pub operation: Operation,
    /// Caller-supplied id echoed back with the assigned CSN.
    pub correlation_id: Option<Uuid>,
}

impl UpdateRecord {
    /// Creates a record without a correlation id.
    pub fn new(csn: Csn, entry_dn: impl Into<String>, operation: Operation) -> Self {
        Self {
            csn,
            entry_dn: entry_dn.into(),
            operation,
            correlation_id: None,
        }
    }

    /// Attaches a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Replica that originated the change.
    #[must_use]
    pub fn replica_id(&self) -> u16 {
        self.csn.replica_id()
    }
}

impl LogRecord for UpdateRecord {
    type Key = Csn;

    fn key(&self) -> Csn {
        self.csn
    }

    fn encode_payload(&self) -> ChangelogResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out).map_err(|e| ChangelogError::Codec(e.to_string()))?;
        Ok(out)
    }

    fn decode_payload(bytes: &[u8]) -> ChangelogResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ChangelogError::Codec(e.to_string()))
    }

    fn parse_key(token: &str) -> Option<Csn> {
        token.parse().ok()
    }
}
