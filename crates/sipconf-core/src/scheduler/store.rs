use indexmap::IndexMap;
use tracing::debug;

use super::info::ConferenceInfo;
use crate::types::SipAddress;

/// Scheduling records known to a core, keyed by conference address
#[derive(Debug, Clone, Default)]
pub struct ConferenceInfoStore {
    records: IndexMap<SipAddress, ConferenceInfo>,
}

impl ConferenceInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record of its conference. Records without a
    /// conference address cannot be stored.
    pub fn upsert(&mut self, info: ConferenceInfo) -> bool {
        let Some(uri) = info.uri.clone() else {
            return false;
        };
        // A record older than the stored one is ignored
        if let Some(existing) = self.records.get(&uri) {
            if existing.ics_sequence > info.ics_sequence {
                debug!(conference = %uri, "ignoring outdated conference information");
                return false;
            }
        }
        self.records.insert(uri, info);
        true
    }

    pub fn get(&self, uri: &SipAddress) -> Option<&ConferenceInfo> {
        self.records.get(uri)
    }

    pub fn remove(&mut self, uri: &SipAddress) -> Option<ConferenceInfo> {
        self.records.shift_remove(uri)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConferenceInfo> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_newest_sequence() {
        let uri = SipAddress::new("focus", "example.org").with_param("conf-id", "1");
        let mut info = ConferenceInfo::new(SipAddress::new("marie", "example.org")).with_subject("v1");
        info.uri = Some(uri.clone());
        info.ics_sequence = 1;

        let mut store = ConferenceInfoStore::new();
        assert!(store.upsert(info.clone()));

        let mut stale = info.clone().with_subject("v0");
        stale.ics_sequence = 0;
        assert!(!store.upsert(stale));
        assert_eq!(store.get(&uri).unwrap().subject, "v1");

        let mut without_uri = info.clone();
        without_uri.uri = None;
        assert!(!store.upsert(without_uri));
        assert_eq!(store.len(), 1);
    }
}
