//! Fuzz the arena parser and the operations that follow it.
//!
//! Arbitrary bytes must never panic: parsing either fails cleanly or
//! yields a tree whose expansion, size evaluation, and re-serialization
//! all hold together.

#![no_main]

use libfuzzer_sys::fuzz_target;

use knvtree::KnvArena;

fuzz_target!(|data: &[u8]| {
    let mut arena = KnvArena::new();
    let Ok(root) = arena.parse(data) else {
        return;
    };
    let _ = arena.expand(root);
    let eval = arena.evaluate_size(root);
    if let Ok(bytes) = arena.serialize(root, true) {
        assert_eq!(bytes.len() as u32, eval);
        // A clean parse of our own output must succeed.
        let reparsed = arena.parse(&bytes).expect("own output must reparse");
        let _ = arena.dump(reparsed);
    }
    arena.release(root);
});
