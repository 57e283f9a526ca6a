// Copyright (c) 2026 Joseph Verdicchio and PCQ Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use pcq_core::cas::{collect_garbage, BlobStore, FsCas};
use pcq_core::digest::parse_hash32;
use pcq_core::exec::{CancelToken, ExecutionError, ExecutionMode, ExportSink};
use pcq_core::keys::{generate_signing_key_file, KeyRing, SigningKeySource};
use pcq_core::ledger::{LedgerSet, ReceiptEntry};
use pcq_core::manifest::{Manifest, ManifestSigner, ManifestWriter};
use pcq_core::plan::{Dag, NodeSpec, PlanSpec, SeedMap};
use pcq_core::policy::{Action, Attrs, PolicyCompiler, PolicyGate, PolicyStore};
use pcq_core::sim::{load_corpus, Simulator};
use pcq_core::verify::{OriginalInputs, Verifier};
use pcq_core::{EngineConfig, Executor, Hash32};

const EXIT_FAIL: u8 = 2;
const EXIT_ERROR: u8 = 1;

#[derive(Parser)]
#[command(name = "pcqctl", about = "Compile policies, run and verify proof-carrying queries")]
struct Cli {
    /// Overrides PCQ_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a policy source file into a module stored in the CAS.
    Compile {
        source: PathBuf,
        /// Module this source replaces; tenant must match and version increase.
        #[arg(long)]
        prior: Option<String>,
        #[arg(long)]
        install: bool,
        /// Install and make the module the tenant's active one.
        #[arg(long)]
        activate: bool,
    },
    /// Evaluate one request against a module.
    Evaluate {
        #[arg(long)]
        module: Option<String>,
        /// Use the tenant's active module when --module is not given.
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        action: String,
        #[arg(long = "subject", value_parser = parse_attr)]
        subject: Vec<(String, String)>,
        #[arg(long = "resource", value_parser = parse_attr)]
        resource: Vec<(String, String)>,
        #[arg(long = "context", value_parser = parse_attr)]
        context: Vec<(String, String)>,
        /// Append a decision receipt to the tenant's ledger.
        #[arg(long)]
        receipt: bool,
    },
    /// Execute a plan under the tenant's active policy and seal a manifest.
    Run {
        plan: PathBuf,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        module: Option<String>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long = "subject", value_parser = parse_attr)]
        subject: Vec<(String, String)>,
        #[arg(long = "context", value_parser = parse_attr)]
        context: Vec<(String, String)>,
        /// Signing key file; PCQ_KEY_PROVIDER=env reads PCQ_SIGNING_KEY_HEX instead.
        #[arg(long)]
        key: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = RunMode::Live)]
        mode: RunMode,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replay a manifest and print the verification report. Exit 0 on PASS, 2 on FAIL.
    Verify {
        manifest: PathBuf,
        /// Trusted verifier keys: {"keys": {"<key_id>": "<pubkey_hex>"}}.
        #[arg(long)]
        keys: PathBuf,
        #[arg(long = "subject", value_parser = parse_attr)]
        subject: Vec<(String, String)>,
        #[arg(long = "context", value_parser = parse_attr)]
        context: Vec<(String, String)>,
    },
    /// Diff two modules over a JSON Lines corpus of historical requests.
    Simulate {
        #[arg(long)]
        baseline: String,
        #[arg(long)]
        candidate: String,
        #[arg(long)]
        corpus: PathBuf,
        /// Replay referenced plans read-only to count affected records.
        #[arg(long)]
        replay_plans: bool,
    },
    Ledger {
        #[command(subcommand)]
        cmd: LedgerCmd,
    },
    Cas {
        #[command(subcommand)]
        cmd: CasCmd,
    },
    /// Generate an Ed25519 signing key and optionally trust it in a key ring.
    Keygen {
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        keyring: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LedgerCmd {
    /// Append a receipt entry read from a JSON file.
    Append {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        entry: PathBuf,
    },
    Revoke {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        manifest_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Check the tenant's receipt chain. Exit 0 when intact, 2 when broken.
    Verify {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        from: Option<String>,
    },
    Show {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand)]
enum CasCmd {
    Put { file: PathBuf },
    /// Remove blobs no manifest, plan or installed module references.
    Gc,
}

#[derive(Clone, Copy, ValueEnum)]
enum RunMode {
    Live,
    ReadOnly,
}

/// What a command reports back: a JSON document and whether it is a failure verdict.
struct Outcome {
    body: Value,
    failed: bool,
}

impl Outcome {
    fn ok(body: Value) -> Self {
        Self {
            body,
            failed: false,
        }
    }

    fn verdict(body: Value, passed: bool) -> Self {
        Self {
            body,
            failed: !passed,
        }
    }
}

fn parse_attr(raw: &str) -> Result<(String, String), String> {
    let (k, v) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if k.is_empty() {
        return Err(format!("empty attribute name in {raw:?}"));
    }
    Ok((k.to_string(), v.to_string()))
}

fn attrs(pairs: Vec<(String, String)>) -> Attrs {
    pairs.into_iter().collect()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn hash_arg(name: &str, raw: &str) -> Result<Hash32> {
    parse_hash32(raw).map_err(|e| anyhow!("--{name}: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    let outcome = EngineConfig::from_env()
        .context("invalid engine configuration")
        .and_then(|config| {
            let config = match &cli.data_dir {
                Some(dir) => config.with_data_dir(dir),
                None => config,
            };
            Ctl::open(config)?.dispatch(cli.cmd)
        });
    match outcome {
        Ok(out) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&out.body).unwrap_or_default()
            );
            if out.failed {
                ExitCode::from(EXIT_FAIL)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            println!("{}", json!({"error": format!("{err:#}")}));
            ExitCode::from(EXIT_ERROR)
        }
    }
}

struct Ctl {
    config: EngineConfig,
    cas: Arc<FsCas>,
}

impl Ctl {
    fn open(config: EngineConfig) -> Result<Self> {
        let cas = FsCas::open(config.cas_dir())
            .with_context(|| format!("failed to open cas at {}", config.cas_dir().display()))?;
        Ok(Self {
            config,
            cas: Arc::new(cas),
        })
    }

    fn store(&self) -> Result<PolicyStore> {
        PolicyStore::open(&self.config.data_dir, self.cas.clone())
            .context("failed to open policy store")
    }

    fn ledgers(&self) -> Result<LedgerSet> {
        LedgerSet::open(self.config.ledger_dir()).context("failed to open receipt ledger")
    }

    fn dispatch(&self, cmd: Command) -> Result<Outcome> {
        match cmd {
            Command::Compile {
                source,
                prior,
                install,
                activate,
            } => self.compile(&source, prior.as_deref(), install || activate, activate),
            Command::Evaluate {
                module,
                tenant,
                action,
                subject,
                resource,
                context,
                receipt,
            } => self.evaluate(
                module.as_deref(),
                tenant.as_deref(),
                &action,
                attrs(subject),
                attrs(resource),
                attrs(context),
                receipt,
            ),
            Command::Run {
                plan,
                tenant,
                module,
                seed,
                subject,
                context,
                key,
                mode,
                out,
            } => self.run(RunArgs {
                plan,
                tenant,
                module,
                seed,
                subject: attrs(subject),
                context: attrs(context),
                key,
                mode,
                out,
            }),
            Command::Verify {
                manifest,
                keys,
                subject,
                context,
            } => self.verify(&manifest, &keys, attrs(subject), attrs(context)),
            Command::Simulate {
                baseline,
                candidate,
                corpus,
                replay_plans,
            } => self.simulate(&baseline, &candidate, &corpus, replay_plans),
            Command::Ledger { cmd } => self.ledger(cmd),
            Command::Cas { cmd } => self.cas(cmd),
            Command::Keygen { out, keyring } => keygen(&out, keyring.as_deref()),
        }
    }

    fn compile(
        &self,
        source: &Path,
        prior: Option<&str>,
        install: bool,
        activate: bool,
    ) -> Result<Outcome> {
        let text = fs::read_to_string(source)
            .with_context(|| format!("failed to read policy source {}", source.display()))?;
        let prior = prior.map(|p| hash_arg("prior", p)).transpose()?;
        let module = PolicyCompiler::new(self.cas.clone())
            .with_compiled_at(now_secs())
            .compile(&text, prior.as_ref())
            .with_context(|| format!("failed to compile {}", source.display()))?;
        if install {
            self.store()?.install(&module)?;
        }
        if activate {
            self.store()?
                .activate(&module.tenant, &module.module_hash)
                .context("activation refused")?;
        }
        Ok(Outcome::ok(json!({
            "module_hash": hex::encode(module.module_hash),
            "source_dsl_hash": hex::encode(module.source_dsl_hash),
            "name": module.name,
            "tenant": module.tenant,
            "version": module.version,
            "rules": module.rule_ids().collect::<Vec<_>>(),
            "installed": install,
            "active": activate,
        })))
    }

    fn resolve_module(
        &self,
        module: Option<&str>,
        tenant: Option<&str>,
    ) -> Result<pcq_core::PolicyModule> {
        let store = self.store()?;
        match (module, tenant) {
            (Some(hash), _) => Ok(store.get(&hash_arg("module", hash)?)?),
            (None, Some(tenant)) => store
                .active_module(tenant)?
                .ok_or_else(|| anyhow!("tenant {tenant} has no active policy module")),
            (None, None) => bail!("either --module or --tenant is required"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        module: Option<&str>,
        tenant: Option<&str>,
        action: &str,
        subject: Attrs,
        resource: Attrs,
        context: Attrs,
        receipt: bool,
    ) -> Result<Outcome> {
        let module = self.resolve_module(module, tenant)?;
        let action = Action::parse(action).ok_or_else(|| anyhow!("unknown action {action:?}"))?;
        let decision = pcq_core::policy::evaluate(&module, &subject, action, &resource, &context);
        let mut body = serde_json::to_value(&decision)?;
        if receipt {
            let r = self
                .ledgers()?
                .append(&module.tenant, ReceiptEntry::for_decision(&decision, now_secs()))?;
            body["receipt_id"] = json!(hex::encode(r.receipt_id));
        }
        Ok(Outcome::ok(body))
    }

    fn run(&self, args: RunArgs) -> Result<Outcome> {
        let bytes = fs::read(&args.plan)
            .with_context(|| format!("failed to read plan {}", args.plan.display()))?;
        let plan = PlanSpec::from_json(&bytes)
            .with_context(|| format!("failed to parse plan {}", args.plan.display()))?;
        let module = Arc::new(self.resolve_module(args.module.as_deref(), Some(&args.tenant))?);
        if module.tenant != args.tenant {
            bail!(
                "module belongs to tenant {}, not {}",
                module.tenant,
                args.tenant
            );
        }
        let key_path = args
            .key
            .clone()
            .unwrap_or_else(|| self.config.data_dir.join("keys").join("signing.key"));
        let signing_key = SigningKeySource::from_env(&key_path)?
            .load()
            .context("failed to load signing key")?;

        let dag = Dag::compile(&plan, &SeedMap::new(args.seed))?;
        let gate = PolicyGate::new(module.clone(), args.subject, args.context);
        let mode = match args.mode {
            RunMode::Live => ExecutionMode::Live,
            RunMode::ReadOnly => ExecutionMode::ReadOnly,
        };
        let sink = Arc::new(DirExportSink {
            dir: self.config.data_dir.join("exports"),
        });
        let executor = Executor::new(self.cas.clone(), self.config.clone()).with_sink(sink);
        let result = match executor.run(&dag, Some(&gate), mode, &CancelToken::new()) {
            Ok(result) => result,
            Err(failure) => {
                let denied = matches!(failure.error, ExecutionError::PolicyDenied { .. });
                let ledgers = self.ledgers()?;
                if let Some(decision) = &failure.denied_decision {
                    ledgers.append(&args.tenant, ReceiptEntry::for_decision(decision, now_secs()))?;
                }
                let body = json!({
                    "error": failure.error.to_string(),
                    "denied_decision": failure.denied_decision,
                    "completed_nodes": failure
                        .partial_attestations
                        .iter()
                        .map(|a| a.node.name.clone())
                        .collect::<Vec<_>>(),
                });
                if denied {
                    return Ok(Outcome::verdict(body, false));
                }
                return Err(anyhow!("{}", body));
            }
        };

        let suppressed: Vec<String> = result
            .suppressed_side_effects
            .iter()
            .map(hex::encode)
            .collect();
        let manifest = ManifestWriter::new(ManifestSigner::new(signing_key)).write(
            &args.tenant,
            result.policy_module_hash,
            result.attestations,
            now_secs(),
        )?;
        let path = match args.out {
            Some(path) => path,
            None => self
                .config
                .manifests_dir()
                .join(format!("{}.json", manifest.manifest_id_hex())),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, manifest.to_json()?)
            .with_context(|| format!("failed to write manifest {}", path.display()))?;
        // The plan itself is kept so `cas gc` and the simulator can find it again.
        let plan_hash = self.cas.put(&bytes)?;

        let ledgers = self.ledgers()?;
        for decision in manifest
            .node_attestations
            .iter()
            .flat_map(|a| a.policy_decisions.iter())
        {
            ledgers.append(&args.tenant, ReceiptEntry::for_decision(decision, now_secs()))?;
        }
        let receipt = ledgers.append(&args.tenant, ReceiptEntry::for_manifest(&manifest, now_secs()))?;
        Ok(Outcome::ok(json!({
            "manifest_id": manifest.manifest_id_hex(),
            "manifest_path": path.display().to_string(),
            "plan_hash": hex::encode(plan_hash),
            "nodes": manifest.node_attestations.len(),
            "receipt_id": hex::encode(receipt.receipt_id),
            "suppressed_side_effects": suppressed,
        })))
    }

    fn verify(
        &self,
        manifest_path: &Path,
        keys_path: &Path,
        subject: Attrs,
        context: Attrs,
    ) -> Result<Outcome> {
        let bytes = fs::read(manifest_path)
            .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
        let manifest = Manifest::from_json(&bytes)
            .with_context(|| format!("failed to decode manifest {}", manifest_path.display()))?;
        let keys = KeyRing::load(keys_path)?;
        let store = self.store()?;
        let inputs = OriginalInputs {
            blobs: self.cas.clone(),
            policies: &store,
            subject: (!subject.is_empty()).then_some(subject),
            context: (!context.is_empty()).then_some(context),
        };
        let report = Verifier::new(keys, self.config.clone()).verify(&manifest, &inputs);
        let revoked = self
            .ledgers()?
            .chain(&manifest.tenant)?
            .lock()
            .is_revoked(&manifest.manifest_id);
        if revoked {
            tracing::warn!(
                target: "pcq.verify",
                manifest_id = %manifest.manifest_id_hex(),
                "manifest has been revoked"
            );
        }
        let mut body = serde_json::to_value(&report)?;
        body["revoked"] = json!(revoked);
        Ok(Outcome::verdict(body, report.is_pass() && !revoked))
    }

    fn simulate(
        &self,
        baseline: &str,
        candidate: &str,
        corpus: &Path,
        replay_plans: bool,
    ) -> Result<Outcome> {
        let store = self.store()?;
        let baseline = store.get(&hash_arg("baseline", baseline)?)?;
        let candidate = store.get(&hash_arg("candidate", candidate)?)?;
        let text = fs::read(corpus)
            .with_context(|| format!("failed to read corpus {}", corpus.display()))?;
        let corpus = load_corpus(&text)?;
        let mut sim = Simulator::new();
        if replay_plans {
            sim = sim.with_plan_replay(self.cas.clone(), self.config.clone());
        }
        let report = sim.run(&baseline, &candidate, &corpus);
        Ok(Outcome::ok(serde_json::to_value(&report)?))
    }

    fn ledger(&self, cmd: LedgerCmd) -> Result<Outcome> {
        let ledgers = self.ledgers()?;
        match cmd {
            LedgerCmd::Append { tenant, entry } => {
                let bytes = fs::read(&entry)
                    .with_context(|| format!("failed to read entry {}", entry.display()))?;
                let entry: ReceiptEntry =
                    serde_json::from_slice(&bytes).context("malformed receipt entry")?;
                let receipt = ledgers.append(&tenant, entry)?;
                Ok(Outcome::ok(serde_json::to_value(&receipt)?))
            }
            LedgerCmd::Revoke {
                tenant,
                manifest_id,
                reason,
            } => {
                let id = hash_arg("manifest-id", &manifest_id)?;
                let receipt = ledgers
                    .chain(&tenant)?
                    .lock()
                    .revoke_manifest(id, &reason, now_secs())?;
                Ok(Outcome::ok(serde_json::to_value(&receipt)?))
            }
            LedgerCmd::Verify { tenant, from } => {
                let from = from.map(|f| hash_arg("from", &f)).transpose()?;
                let chain = ledgers.chain(&tenant)?;
                let ledger = chain.lock();
                match ledger.verify_chain(from.as_ref()) {
                    Ok(checked) => Ok(Outcome::ok(json!({
                        "tenant": tenant,
                        "intact": true,
                        "receipts_checked": checked,
                    }))),
                    Err(e) => {
                        tracing::error!(
                            target: "pcq.ledger",
                            tenant = %tenant,
                            error = %e,
                            "receipt chain integrity failure"
                        );
                        Ok(Outcome::verdict(
                            json!({"tenant": tenant, "intact": false, "break": e}),
                            false,
                        ))
                    }
                }
            }
            LedgerCmd::Show { tenant } => {
                let chain = ledgers.chain(&tenant)?;
                let receipts = chain.lock().receipts()?;
                Ok(Outcome::ok(serde_json::to_value(&receipts)?))
            }
        }
    }

    fn cas(&self, cmd: CasCmd) -> Result<Outcome> {
        match cmd {
            CasCmd::Put { file } => {
                let bytes =
                    fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
                let key = self.cas.put(&bytes)?;
                Ok(Outcome::ok(json!({"hash": hex::encode(key), "len": bytes.len()})))
            }
            CasCmd::Gc => {
                let live = self.live_blobs()?;
                let report = collect_garbage(self.cas.as_ref(), &live)?;
                Ok(Outcome::ok(serde_json::to_value(&report)?))
            }
        }
    }

    /// Blobs reachable from stored manifests, installed modules and the plans
    /// named by the simulator's corpus are kept.
    fn live_blobs(&self) -> Result<BTreeSet<Hash32>> {
        let mut live: BTreeSet<Hash32> = self.store()?.installed_hashes()?.into_iter().collect();
        let dir = self.config.manifests_dir();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = fs::read(&path)?;
                let manifest = Manifest::from_json(&bytes)
                    .with_context(|| format!("failed to decode manifest {}", path.display()))?;
                live.extend(manifest.referenced_blobs());
                live.extend(manifest.policy_module_hash);
            }
        }
        // Plans are small and referenced by hash from historical queries; keep them all.
        for key in self.cas.list()? {
            if let Ok(bytes) = self.cas.get(&key) {
                if PlanSpec::from_json(&bytes).is_ok() {
                    live.insert(key);
                }
            }
        }
        Ok(live)
    }
}

struct RunArgs {
    plan: PathBuf,
    tenant: String,
    module: Option<String>,
    seed: u64,
    subject: Attrs,
    context: Attrs,
    key: Option<PathBuf>,
    mode: RunMode,
    out: Option<PathBuf>,
}

/// Writes exported blobs to `<data>/exports/<node>-<hash>.json`.
struct DirExportSink {
    dir: PathBuf,
}

impl ExportSink for DirExportSink {
    fn export(&self, node: &NodeSpec, output_hash: &Hash32, bytes: &[u8]) -> Result<(), String> {
        fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        let path = self
            .dir
            .join(format!("{}-{}.json", node.name, hex::encode(output_hash)));
        fs::write(&path, bytes).map_err(|e| e.to_string())?;
        tracing::info!(target: "pcq.exec", node = %node.name, path = %path.display(), "exported");
        Ok(())
    }
}

fn keygen(out: &Path, keyring: Option<&Path>) -> Result<Outcome> {
    if out.exists() {
        bail!("{} already exists; refusing to overwrite a signing key", out.display());
    }
    let key = generate_signing_key_file(out)?;
    let verifying = key.verifying_key();
    let mut body = json!({
        "key_path": out.display().to_string(),
        "public_key": hex::encode(verifying.as_bytes()),
    });
    let kid = match keyring {
        Some(path) => {
            let mut ring = if path.exists() {
                KeyRing::load(path)?
            } else {
                KeyRing::new()
            };
            let kid = ring.insert(verifying);
            fs::write(path, ring.to_json())
                .with_context(|| format!("failed to write key ring {}", path.display()))?;
            body["keyring"] = json!(path.display().to_string());
            kid
        }
        None => pcq_core::keys::key_id_for(verifying.as_bytes()),
    };
    body["key_id"] = json!(kid);
    Ok(Outcome::ok(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_parse_as_key_value() {
        assert_eq!(
            parse_attr("purpose=research").unwrap(),
            ("purpose".to_string(), "research".to_string())
        );
        assert_eq!(
            parse_attr("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_attr("novalue").is_err());
        assert!(parse_attr("=x").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn keygen_refuses_to_overwrite_and_fills_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("signing.key");
        let ring = dir.path().join("keys.json");
        let out = keygen(&key, Some(&ring)).unwrap();
        let kid = out.body["key_id"].as_str().unwrap().to_string();
        let loaded = KeyRing::load(&ring).unwrap();
        assert!(loaded.get(&kid).is_some());
        assert!(keygen(&key, None).is_err());
    }

    #[test]
    fn compile_run_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = Ctl::open(EngineConfig::default().with_data_dir(dir.path())).unwrap();

        let policy = dir.path().join("policy.lac");
        fs::write(
            &policy,
            "lac v1; policy \"ctl\" tenant \"acme\" version 1;\n\
             grant g { allow: read; where: subject.role == \"analyst\"; }\n",
        )
        .unwrap();
        let compiled = ctl.dispatch(Command::Compile {
            source: policy,
            prior: None,
            install: true,
            activate: true,
        })
        .unwrap();
        assert_eq!(compiled.body["active"], json!(true));

        let source = ctl.cas.put(br#"[{"v": 1}, {"v": 2}]"#).unwrap();
        let plan = dir.path().join("plan.json");
        fs::write(
            &plan,
            json!({"nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": hex::encode(source)}],
                 "governed": {"action": "read", "resource": {}}},
                {"name": "total", "operator": "sum", "inputs": [{"node": "load"}],
                 "params": {"field": "v"}}
            ]})
            .to_string(),
        )
        .unwrap();
        let key = dir.path().join("signing.key");
        let ring = dir.path().join("keys.json");
        keygen(&key, Some(&ring)).unwrap();

        let ran = ctl.dispatch(Command::Run {
            plan: plan.clone(),
            tenant: "acme".into(),
            module: None,
            seed: 3,
            subject: vec![("role".into(), "analyst".into())],
            context: vec![],
            key: Some(key.clone()),
            mode: RunMode::Live,
            out: None,
        })
        .unwrap();
        assert!(!ran.failed);
        let manifest_path = PathBuf::from(ran.body["manifest_path"].as_str().unwrap());

        let verified = ctl.dispatch(Command::Verify {
            manifest: manifest_path,
            keys: ring,
            subject: vec![],
            context: vec![],
        })
        .unwrap();
        assert!(!verified.failed, "{}", verified.body);

        let denied = ctl.dispatch(Command::Run {
            plan,
            tenant: "acme".into(),
            module: None,
            seed: 3,
            subject: vec![("role".into(), "guest".into())],
            context: vec![],
            key: Some(key),
            mode: RunMode::Live,
            out: None,
        })
        .unwrap();
        assert!(denied.failed);

        let chain = ctl.dispatch(Command::Ledger {
            cmd: LedgerCmd::Verify {
                tenant: "acme".into(),
                from: None,
            },
        })
        .unwrap();
        assert_eq!(chain.body["intact"], json!(true));
        // One decision and one manifest receipt, then the denial receipt.
        assert_eq!(chain.body["receipts_checked"], json!(3));
    }
}
