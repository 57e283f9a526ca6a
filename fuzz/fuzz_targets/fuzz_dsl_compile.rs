#![no_main]

use libfuzzer_sys::fuzz_target;
use pcq_core::policy::{compile_source, PolicyModule};

fuzz_target!(|data: &[u8]| {
    let Ok(src) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(module) = compile_source(src, 0) {
        // Whatever compiles must decode back to the same module.
        let decoded = PolicyModule::from_bytes(module.bytes()).expect("compiled module decodes");
        assert_eq!(decoded.module_hash, module.module_hash);
    }
});
