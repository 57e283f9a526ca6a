use std::sync::Arc;

use ed25519_dalek::SigningKey;
use pcq_core::cas::{BlobStore, MemoryCas};
use pcq_core::exec::ExecutionError;
use pcq_core::ledger::{ReceiptEntry, ReceiptLedger};
use pcq_core::manifest::{Manifest, ManifestSigner, ManifestWriter};
use pcq_core::policy::{compile_source, Attrs, Effect, ModuleSet, PolicyGate, ReasonCode};
use pcq_core::verify::{CheckKind, DivergenceOrigin, OriginalInputs, Verdict, Verifier};
use pcq_core::{EngineConfig, Executor, KeyRing, PlanSpec, SeedMap};
use serde_json::json;

const POLICY: &str = r#"lac v1;
policy "clinical" tenant "acme" version 3;
grant analysts { allow: read; where: subject.role == "analyst"; }
purpose research_only { actions: read; require: "research"; }
"#;

fn attrs(pairs: &[(&str, &str)]) -> Attrs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn plan(source: &str) -> PlanSpec {
    serde_json::from_value(json!({
        "name": "cohort-total",
        "nodes": [
            {"name": "load", "operator": "load", "inputs": [{"blob": source}],
             "governed": {"action": "read", "resource": {"dataset": "visits"}}},
            {"name": "adults", "operator": "filter", "inputs": [{"node": "load"}],
             "params": {"field": "adult", "equals": true}},
            {"name": "total", "operator": "sum", "inputs": [{"node": "adults"}],
             "params": {"field": "cost"}}
        ]
    }))
    .unwrap()
}

struct World {
    cas: Arc<MemoryCas>,
    plan: PlanSpec,
    module: Arc<pcq_core::PolicyModule>,
    signer_key: SigningKey,
}

fn world() -> World {
    let cas = Arc::new(MemoryCas::new());
    let rows: Vec<_> = (0..10)
        .map(|i| json!({"id": i, "adult": i % 2 == 0, "cost": i * 10}))
        .collect();
    let source = cas.put(&serde_json::to_vec_pretty(&rows).unwrap()).unwrap();
    World {
        cas,
        plan: plan(&hex::encode(source)),
        module: Arc::new(compile_source(POLICY, 1_700_000_000).unwrap()),
        signer_key: SigningKey::from_bytes(&[3u8; 32]),
    }
}

fn run_and_seal(w: &World) -> Manifest {
    let gate = PolicyGate::new(
        w.module.clone(),
        attrs(&[("role", "analyst")]),
        attrs(&[("purpose", "research")]),
    );
    let result = Executor::new(w.cas.clone(), EngineConfig::default())
        .execute(&w.plan, &SeedMap::new(7), Some(&gate))
        .unwrap();
    assert_eq!(result.attestations.len(), 3);
    let total = result
        .attestations
        .iter()
        .find(|a| a.node.name == "total")
        .unwrap();
    let bytes = w.cas.get(&total.output_hash).unwrap();
    // Even ids 0..10 are adults: 0 + 20 + 40 + 60 + 80.
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(), json!(200));

    ManifestWriter::new(ManifestSigner::new(w.signer_key.clone()))
        .write("acme", result.policy_module_hash, result.attestations, 1_700_000_100)
        .unwrap()
}

fn verify(w: &World, manifest: &Manifest) -> pcq_core::VerificationReport {
    let keys = KeyRing::new().with(w.signer_key.verifying_key());
    let policies = ModuleSet::new().with(w.module.clone());
    let inputs = OriginalInputs {
        blobs: w.cas.clone(),
        policies: &policies,
        subject: None,
        context: None,
    };
    Verifier::new(keys, EngineConfig::default()).verify(manifest, &inputs)
}

#[test]
fn marketing_purpose_is_denied_before_any_read() {
    let w = world();
    let gate = PolicyGate::new(
        w.module.clone(),
        attrs(&[("role", "analyst")]),
        attrs(&[("purpose", "marketing")]),
    );
    let blobs_before = w.cas.len();
    let failure = Executor::new(w.cas.clone(), EngineConfig::default())
        .execute(&w.plan, &SeedMap::new(7), Some(&gate))
        .unwrap_err();

    match &failure.error {
        ExecutionError::PolicyDenied {
            reason_code,
            cited_rule_id,
            ..
        } => {
            assert_eq!(*reason_code, ReasonCode::PurposeMismatch);
            assert_eq!(cited_rule_id.as_deref(), Some("research_only"));
        }
        other => panic!("expected a policy denial, got {other:?}"),
    }
    let denied = failure.denied_decision.unwrap();
    assert_eq!(denied.result, Effect::Deny);
    assert!(failure.partial_attestations.is_empty());
    assert_eq!(w.cas.len(), blobs_before);
}

#[test]
fn sealed_run_verifies_and_tampering_is_pinpointed() {
    let w = world();
    let manifest = run_and_seal(&w);

    let round_tripped = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
    let report = verify(&w, &round_tripped);
    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.divergences);
    assert_eq!(report.nodes_replayed, 3);
    assert_eq!(report.decisions_reevaluated, 1);
    assert!(report.first_divergence.is_none());

    let mut tampered = manifest.clone();
    let idx = tampered
        .node_attestations
        .iter()
        .position(|a| a.node.name == "adults")
        .unwrap();
    tampered.node_attestations[idx].output_hash[31] ^= 0x80;
    let report = verify(&w, &tampered);
    assert_eq!(report.verdict, Verdict::Fail);
    let first = report.first_divergence.as_ref().unwrap();
    assert_eq!(first.node_name.as_deref(), Some("adults"));
    assert_eq!(first.origin, DivergenceOrigin::Data);
    assert!(report
        .divergences
        .iter()
        .any(|d| d.check == CheckKind::MerkleRoot));
}

#[test]
fn receipts_bind_decisions_and_manifest() {
    let w = world();
    let manifest = run_and_seal(&w);
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();

    for decision in manifest
        .node_attestations
        .iter()
        .flat_map(|a| a.policy_decisions.iter())
    {
        ledger
            .append(ReceiptEntry::for_decision(decision, 1_700_000_050))
            .unwrap();
    }
    let sealed = ledger
        .append(ReceiptEntry::for_manifest(&manifest, 1_700_000_100))
        .unwrap();
    assert_eq!(sealed.entry.manifest_id, Some(manifest.manifest_id));
    assert_eq!(sealed.sequence, 1);
    assert_eq!(ledger.verify_chain(None), Ok(2));

    ledger
        .revoke_manifest(manifest.manifest_id, "signing key rotated", 1_700_000_200)
        .unwrap();
    assert!(ledger.is_revoked(&manifest.manifest_id));
    assert!(ledger.is_intact());
}
