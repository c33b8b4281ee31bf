//! Set reconciliation of two event logs.
//!
//! Merging is a union keyed by record id. The local log keeps its order and
//! its hash chain; remote records it has never seen are appended in the
//! order the remote log holds them. Because the seen-sets are merged too, a
//! record one side already expired is not brought back by the other.
//!
//! As sets of ids, `merge` is commutative, associative and idempotent. The
//! resulting *order* is biased towards the local side.

use crate::error::{MeshError, MeshResult};
use crate::log::{EventLog, EventRecord};

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids of remote records appended to the local log
    pub added: Vec<String>,
    /// Remote records skipped because their id was already seen locally
    pub duplicates: usize,
}

impl MergeReport {
    /// Whether the merge added nothing.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
    }
}

fn ensure_same_tunnel(local: &EventLog, remote: &EventLog) -> MeshResult<()> {
    if local.tunnel_id() != remote.tunnel_id() {
        return Err(MeshError::MalformedImport(format!(
            "cannot merge tunnel {} into {}",
            remote.tunnel_id(),
            local.tunnel_id()
        )));
    }
    Ok(())
}

/// Merge `remote` into a copy of `local`.
pub fn merge(local: &EventLog, remote: &EventLog) -> MeshResult<EventLog> {
    merge_with_report(local, remote).map(|(log, _)| log)
}

/// [`merge`], also reporting which records were added.
///
/// Remote chain digests describe the remote node's chain and are dropped
/// from the appended records.
pub fn merge_with_report(
    local: &EventLog,
    remote: &EventLog,
) -> MeshResult<(EventLog, MergeReport)> {
    ensure_same_tunnel(local, remote)?;

    let mut merged = local.clone();
    let mut report = MergeReport::default();

    for record in remote.records() {
        if merged.seen_ids.contains(&record.id) {
            report.duplicates += 1;
            continue;
        }
        let mut record = record.clone();
        record.chain_digest = None;
        merged.seen_ids.insert(record.id.clone());
        report.added.push(record.id.clone());
        merged.records.push(record);
    }

    merged.seen_ids.extend(remote.seen_ids().iter().cloned());

    Ok((merged, report))
}

/// Remote records the local log has never seen, in remote order.
pub fn diff<'a>(local: &EventLog, remote: &'a EventLog) -> MeshResult<Vec<&'a EventRecord>> {
    ensure_same_tunnel(local, remote)?;
    Ok(remote
        .records()
        .iter()
        .filter(|r| !local.has_seen(&r.id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SharedKeySigner;
    use crate::keys::{tunnel_id, SymmetricKey};
    use crate::log::NewEvent;
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct Fixture {
        key: SymmetricKey,
        signer: SharedKeySigner,
    }

    impl Fixture {
        fn new() -> Self {
            let key = SymmetricKey::generate();
            let signer = SharedKeySigner::new(&key);
            Self { key, signer }
        }

        fn log(&self) -> EventLog {
            EventLog::new(tunnel_id("alpha", 16).unwrap(), true)
        }

        fn send(&self, log: &mut EventLog, sender: &str, text: &str, at: i64) -> String {
            log.append(&NewEvent::text(sender, text, at), &self.key, None, &self.signer)
                .unwrap()
                .into_record()
                .id
        }
    }

    fn ids(log: &EventLog) -> Vec<String> {
        log.records().iter().map(|r| r.id.clone()).collect()
    }

    fn id_set(log: &EventLog) -> BTreeSet<String> {
        log.records().iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_merge_local_first_then_remote() {
        let f = Fixture::new();
        let mut a = f.log();
        let mut b = f.log();
        let m1 = f.send(&mut a, "u1", "m1", 1);
        let m2 = f.send(&mut b, "u2", "m2", 2);
        let m3 = f.send(&mut a, "u1", "m3", 3);

        let (merged, report) = merge_with_report(&a, &b).unwrap();
        assert_eq!(ids(&merged), vec![m1.clone(), m3.clone(), m2.clone()]);
        assert_eq!(report.added, vec![m2.clone()]);
        assert_eq!(report.duplicates, 0);

        let reverse = merge(&b, &a).unwrap();
        assert_eq!(ids(&reverse), vec![m2, m1, m3]);
        assert_eq!(id_set(&merged), id_set(&reverse));
    }

    #[test]
    fn test_merge_idempotent() {
        let f = Fixture::new();
        let mut a = f.log();
        let mut b = f.log();
        f.send(&mut a, "u1", "x", 1);
        f.send(&mut b, "u2", "y", 2);

        let once = merge(&a, &b).unwrap();
        let twice = merge(&once, &b).unwrap();
        assert_eq!(once, twice);

        let (_, report) = merge_with_report(&once, &b).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_merge_with_empty() {
        let f = Fixture::new();
        let mut a = f.log();
        f.send(&mut a, "u1", "x", 1);

        assert_eq!(merge(&a, &f.log()).unwrap(), a);
        assert_eq!(id_set(&merge(&f.log(), &a).unwrap()), id_set(&a));
    }

    #[test]
    fn test_merge_associative_as_sets() {
        let f = Fixture::new();
        let (mut a, mut b, mut c) = (f.log(), f.log(), f.log());
        f.send(&mut a, "u1", "a", 1);
        f.send(&mut b, "u2", "b", 2);
        f.send(&mut c, "u3", "c", 3);

        let left = merge(&merge(&a, &b).unwrap(), &c).unwrap();
        let right = merge(&a, &merge(&b, &c).unwrap()).unwrap();
        assert_eq!(id_set(&left), id_set(&right));
        assert_eq!(left.seen_ids(), right.seen_ids());
    }

    #[test]
    fn test_merge_keeps_local_chain() {
        let f = Fixture::new();
        let mut a = f.log();
        let mut b = f.log();
        f.send(&mut a, "u1", "x", 1);
        f.send(&mut b, "u2", "y", 2);

        let merged = merge(&a, &b).unwrap();
        assert_eq!(merged.chain_tip(), a.chain_tip());
        assert_eq!(merged.chain(), a.chain());
        assert!(merged.records()[1].chain_digest.is_none());
        merged.validate_chain().unwrap();
        merged.validate().unwrap();
    }

    #[test]
    fn test_merge_does_not_resurrect_expired() {
        let f = Fixture::new();
        let mut a = f.log();
        let event = NewEvent::text("u1", "brief", 0).with_ttl(Duration::from_secs(5));
        let id = a
            .append(&event, &f.key, None, &f.signer)
            .unwrap()
            .into_record()
            .id;
        let stale_copy = a.clone();

        a.purge_expired(6_000);
        let merged = merge(&a, &stale_copy).unwrap();
        assert!(!merged.contains(&id));
        assert!(merged.has_seen(&id));
    }

    #[test]
    fn test_merge_rejects_foreign_tunnel() {
        let f = Fixture::new();
        let a = f.log();
        let b = EventLog::new(tunnel_id("beta", 16).unwrap(), true);
        assert!(matches!(merge(&a, &b), Err(MeshError::MalformedImport(_))));
        assert!(matches!(diff(&a, &b), Err(MeshError::MalformedImport(_))));
    }

    #[test]
    fn test_diff() {
        let f = Fixture::new();
        let mut a = f.log();
        let mut b = f.log();
        let shared = f.send(&mut a, "u1", "shared", 1);
        b = merge(&b, &a).unwrap();
        let only_b = f.send(&mut b, "u2", "only b", 2);

        let missing: Vec<_> = diff(&a, &b).unwrap().iter().map(|r| r.id.clone()).collect();
        assert_eq!(missing, vec![only_b]);
        assert!(diff(&b, &a).unwrap().is_empty());
        assert!(a.contains(&shared));
    }
}
