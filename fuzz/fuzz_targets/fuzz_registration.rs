#![no_main]
#[macro_use] extern crate libfuzzer_sys;
extern crate u2f_enroll;

use u2f_enroll::u2f::attestation::extract_transport;
use u2f_enroll::u2f::proto::der::{ByteCursor, Tag};
use u2f_enroll::u2f::proto::raw_message::{ChallengeParameter, Registration};

fuzz_target!(|data: &[u8]| {
    let _ = extract_transport(data);

    if let Ok(mut seq) = ByteCursor::new(data).read_element(Tag::Sequence) {
        while !seq.is_empty() && seq.read_object_identifier().is_ok() {}
    }

    if let Ok(reg) = Registration::parse(data, "https://example.com", ChallengeParameter::Hash(&[0u8; 32])) {
        let _ = reg.to_bytes();
        let _ = reg.verify_signature_with(reg.user_public_key());
    }

    let _ = Registration::parse(data, "https://example.com", ChallengeParameter::ClientData(data));
});
