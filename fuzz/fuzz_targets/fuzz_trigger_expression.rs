//! Fuzz target for trigger expression parsing.
//!
//! Any expression that parses must re-parse from its rendered form to the
//! same tree.

#![no_main]

use libfuzzer_sys::fuzz_target;
use st_core::TriggerExpr;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(expr) = TriggerExpr::parse(text) {
        let rendered = expr.to_string();
        let reparsed = TriggerExpr::parse(&rendered).expect("rendered trigger must parse");
        assert_eq!(expr, reparsed, "render/parse is not a fixed point for {:?}", rendered);
    }
});
