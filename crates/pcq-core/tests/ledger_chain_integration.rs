use std::sync::Arc;

use pcq_core::ledger::{ChainBreak, LedgerSet, ReceiptEntry, ReceiptKind, ReceiptLedger};
use pcq_core::policy::{compile_source, evaluate, Action, Attrs};

fn decision_entries(n: usize) -> Vec<ReceiptEntry> {
    let module = compile_source(
        r#"lac v1; policy "ledger" tenant "acme" version 2;
           grant g { allow: read; where: subject.role == "analyst"; }"#,
        0,
    )
    .unwrap();
    (0..n)
        .map(|i| {
            let subject: Attrs = [("role".to_string(), "analyst".to_string())].into();
            let resource: Attrs = [("row".to_string(), i.to_string())].into();
            let d = evaluate(&module, &subject, Action::Read, &resource, &Attrs::new());
            ReceiptEntry::for_decision(&d, 1_700_000_000 + i as u64)
        })
        .collect()
}

fn nth(haystack: &[u8], needle: &[u8], n: usize) -> usize {
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .nth(n)
        .unwrap()
}

#[test]
fn concurrent_tenants_keep_separate_intact_chains() {
    let dir = tempfile::tempdir().unwrap();
    let set = Arc::new(LedgerSet::open(dir.path()).unwrap());
    let entries = decision_entries(8);
    std::thread::scope(|scope| {
        for tenant in ["acme", "initech", "umbrella"] {
            for _ in 0..3 {
                let set = set.clone();
                let entries = entries.clone();
                scope.spawn(move || {
                    for e in entries {
                        set.append(tenant, e).unwrap();
                    }
                });
            }
        }
    });
    for tenant in ["acme", "initech", "umbrella"] {
        assert_eq!(set.verify_chain(tenant).unwrap(), Ok(24));
        let chain = set.chain(tenant).unwrap();
        let receipts = chain.lock().receipts().unwrap();
        assert!(receipts.iter().all(|r| r.tenant == tenant));
        assert!(receipts
            .windows(2)
            .all(|w| w[1].prev_receipt_hash == w[0].self_hash));
    }
}

#[test]
fn edited_timestamp_on_disk_breaks_the_chain_at_that_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();
    for e in decision_entries(5) {
        ledger.append(e).unwrap();
    }
    let path = ledger.path().to_path_buf();
    drop(ledger);

    let mut bytes = std::fs::read(&path).unwrap();
    let needle = b"\"timestamp\":17";
    let at = nth(&bytes, needle, 3) + needle.len() - 1;
    bytes[at] = b'8';
    std::fs::write(&path, bytes).unwrap();

    let reopened = ReceiptLedger::open(dir.path(), "acme").unwrap();
    let err = reopened.verify_chain(None).unwrap_err();
    assert_eq!(err.sequence, 3);
    assert_eq!(err.reason, ChainBreak::ReceiptIdMismatch);
    assert!(!reopened.is_intact());
}

#[test]
fn verification_can_start_mid_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();
    let receipts: Vec<_> = decision_entries(6)
        .into_iter()
        .map(|e| ledger.append(e).unwrap())
        .collect();
    assert_eq!(ledger.verify_chain(Some(&receipts[4].receipt_id)), Ok(2));
    let err = ledger.verify_chain(Some(&[0xee; 32])).unwrap_err();
    assert_eq!(err.reason, ChainBreak::UnknownStart);
}

#[test]
fn revocations_persist_and_leave_history_intact() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_id = [0x42; 32];
    {
        let mut ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();
        let mut entry = decision_entries(1).remove(0);
        entry.kind = ReceiptKind::Manifest;
        entry.manifest_id = Some(manifest_id);
        let sealed = ledger.append(entry).unwrap();
        let revoked = ledger
            .revoke_manifest(manifest_id, "attestation key compromised", 1_800_000_000)
            .unwrap();
        assert_eq!(revoked.prev_receipt_hash, sealed.self_hash);
    }
    let ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();
    assert!(ledger.is_revoked(&manifest_id));
    assert!(!ledger.is_revoked(&[0x43; 32]));
    let receipts = ledger.receipts().unwrap();
    assert_eq!(receipts[0].entry.kind, ReceiptKind::Manifest);
    assert_eq!(receipts[1].entry.kind, ReceiptKind::ManifestRevocation);
    assert_eq!(
        receipts[1].entry.reason.as_deref(),
        Some("attestation key compromised")
    );
    assert!(ledger.is_intact());
}
