#![no_main]

use libfuzzer_sys::fuzz_target;
use pcq_core::ledger::ReceiptLedger;

fuzz_target!(|data: &[u8]| {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("fuzz.log"), data).expect("write fuzz input");
    if let Ok(ledger) = ReceiptLedger::open(dir.path(), "fuzz") {
        let _ = ledger.verify_chain(None);
        let _ = ledger.receipts();
    }
});
