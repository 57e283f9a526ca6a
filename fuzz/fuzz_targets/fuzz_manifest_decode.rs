#![no_main]

use libfuzzer_sys::fuzz_target;
use pcq_core::manifest::Manifest;
use pcq_verifier::ManifestEnvelope;

fuzz_target!(|data: &[u8]| {
    if let Ok(manifest) = Manifest::from_json(data) {
        let _ = manifest.check_structure();
        let _ = manifest.referenced_blobs();
    }
    if let Ok(envelope) = ManifestEnvelope::from_json(data) {
        let _ = envelope.root();
        let _ = envelope.verify_with_key(&[0u8; 32]);
    }
});
