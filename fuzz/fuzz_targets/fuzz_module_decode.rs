#![no_main]

use libfuzzer_sys::fuzz_target;
use pcq_core::policy::{evaluate, Action, Attrs, PolicyModule};

#[derive(Debug, arbitrary::Arbitrary)]
struct Input {
    bytes: Vec<u8>,
    action: u8,
    subject: Vec<(String, String)>,
    resource: Vec<(String, String)>,
}

fuzz_target!(|input: Input| {
    let Ok(module) = PolicyModule::from_bytes(&input.bytes) else {
        return;
    };
    let action = Action::ALL[input.action as usize % Action::ALL.len()];
    let subject: Attrs = input.subject.into_iter().collect();
    let resource: Attrs = input.resource.into_iter().collect();
    let a = evaluate(&module, &subject, action, &resource, &Attrs::new());
    let b = evaluate(&module, &subject, action, &resource, &Attrs::new());
    assert_eq!(a, b);
});
