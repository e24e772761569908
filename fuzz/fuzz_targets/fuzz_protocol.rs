//! Fuzz packet decoding across both framings, plus reassembly feeding.

#![no_main]

use libfuzzer_sys::fuzz_target;

use knvtree::KnvProtocol;

fuzz_target!(|data: &[u8]| {
    let Ok(mut p) = KnvProtocol::decode(data) else {
        return;
    };
    let _ = p.is_complete();
    let _ = p.first_request();
    let _ = p.eval_size();
    if let Ok(bytes) = p.encode() {
        // Whatever decoded must re-encode into something decodable.
        let _ = KnvProtocol::decode(&bytes);
    }
    let _ = p.encode_legacy();
});
