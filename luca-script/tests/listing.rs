use std::sync::Arc;

use luca_script::{Disassembler, ScriptBuilder, ScriptError, TitleConfig, TitleConfigBuilder};
use pretty_assertions::assert_eq;

fn utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain([0])
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

fn disassembler(config: &TitleConfig) -> Disassembler {
    Disassembler::new(Arc::new(config.operator_set().unwrap()))
}

#[test]
fn listing_with_labels_and_fallback() {
    let mut b = ScriptBuilder::new();
    b.push(0, &[1, 0, 0, 0]); // EQU
    b.push(1, b"\x01\x001\0"); // ADD
    b.push(3, b"#1==3\0\x26\x00\x00\x00"); // IFY -> 38
    b.push(4, &[8, 0, 0, 0]); // GOTO -> 8
    b.push(9, &[&[2u8, 0][..], &utf16z("Hi")[..]].concat()); // MESSAGE
    b.push(0x99, &[0x01, 0x00, 0x02, 0x00, 0xFF]);
    b.push(8, &[]); // END
    let script = b.build("sample").unwrap();

    let listing = disassembler(&TitleConfig::default()).run(&script).unwrap();
    assert_eq!(
        listing.render(),
        "\
0:equ (#1, 0)
label_2:
8:add (#1, 1)
16:ify (#1==3, label_1)
30:goto (label_2)
label_1:
38:message (2, \"Hi\")
99 (1, 2, 0xFF)
60:end ()
"
    );

    let histogram = listing.histogram();
    assert_eq!(histogram.get("EQU"), Some(&1));
    assert_eq!(histogram.get("99"), Some(&1));
    assert_eq!(histogram.values().sum::<usize>(), 7);
    assert!(listing.dangling_labels().is_empty());
    assert_eq!(listing.failures(), 0);
}

#[test]
fn decode_failure_aborts_unless_keep_going() {
    let mut b = ScriptBuilder::new();
    b.push(0, &[5, 0]); // EQU missing its value
    b.push(8, &[]);
    let script = b.build("broken").unwrap();
    let config = TitleConfig::default();

    let err = disassembler(&config).run(&script).unwrap_err();
    assert!(matches!(err, ScriptError::Instruction { pos: 0, .. }));

    let listing = disassembler(&config).keep_going(true).run(&script).unwrap();
    assert_eq!(listing.render(), "EQU (5)\n6:end ()\n");
    assert_eq!(listing.failures(), 1);
}

#[test]
fn dangling_branch_target_is_reported() {
    let mut b = ScriptBuilder::new();
    b.push(4, &[3, 0, 0, 0]); // GOTO into the middle of itself
    let script = b.build("odd").unwrap();

    let listing = disassembler(&TitleConfig::default()).run(&script).unwrap();
    assert_eq!(listing.render(), "0:goto (label_1)\n");
    assert_eq!(listing.dangling_labels(), vec![3]);
}

#[test]
fn multi_language_message_title() {
    let config = TitleConfigBuilder::new()
        .with_name("two languages")
        .with_opcodes(["MESSAGE"])
        .with_message_languages(2)
        .get();

    let mut b = ScriptBuilder::new();
    b.push(0, &[&[1u8, 0][..], &utf16z("あ")[..], &utf16z("A")[..]].concat());
    b.push(1, &[]);
    let listing = disassembler(&config).run(&b.build("msg").unwrap()).unwrap();
    assert_eq!(listing.render(), "0:message (1, \"あ\", \"A\")\n1 ()\n");
}
