//! Fuzz the profile decoder.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(records) = commprof::storage::decode_records(data) else {
        return;
    };
    // Whatever decodes must re-encode to the same records.
    let bytes =
        commprof::storage::encode_records(&records).expect("decoded records re-encode");
    let again = commprof::storage::decode_records(&bytes).expect("re-encoded profile decodes");
    assert_eq!(records.len(), again.len());
    let _ = commprof::Profile::from_records(records);
});
