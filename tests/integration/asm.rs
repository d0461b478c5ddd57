//! Assembler tests: literals, directives, labels and locals, the call
//! prologue encoding, and every error path.

use ngaro::{assemble, Cell, VmError};

use crate::common::run_source;

fn assert_asm_error(source: &str, fragment: &str) {
    match assemble("test", source) {
        Err(VmError::Assembly { message, pos }) => {
            assert!(
                message.contains(fragment),
                "error {:?} does not mention {:?}",
                message,
                fragment
            );
            assert_eq!(pos.file, "test");
            assert!(pos.line >= 1);
        }
        other => panic!("expected assembly error for {:?}, got {:?}", source, other),
    }
}

#[test]
fn test_mnemonics_emit_codes() {
    assert_eq!(
        assemble("t", "nop dup drop swap push pop ; @ ! + - * /mod").unwrap(),
        vec![0, 2, 3, 4, 5, 6, 9, 14, 15, 16, 17, 18, 19]
    );
    assert_eq!(
        assemble("t", "and or xor << >> 0; 1+ 1- in out wait").unwrap(),
        vec![20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30]
    );
}

#[test]
fn test_operand_opcodes_enter_operand_state() {
    assert_eq!(assemble("t", "lit 25").unwrap(), vec![1, 25]);
    assert_eq!(assemble("t", "loop 4").unwrap(), vec![7, 4]);
    assert_eq!(assemble("t", ">jump 9").unwrap(), vec![10, 9]);
    assert_eq!(assemble("t", "<jump 9").unwrap(), vec![11, 9]);
    assert_eq!(assemble("t", "!jump 9").unwrap(), vec![12, 9]);
    assert_eq!(assemble("t", "=jump 9").unwrap(), vec![13, 9]);
}

#[test]
fn test_integer_bases_and_chars() {
    assert_eq!(
        assemble("t", "0x10 0b101 0o17 -3 'A' '\\n'").unwrap(),
        vec![1, 16, 1, 5, 1, 15, 1, -3, 1, 65, 1, 10]
    );
}

#[test]
fn test_org_moves_compile_address() {
    let img = assemble("t", ".org 4 .dat 7").unwrap();
    assert_eq!(img, vec![0, 0, 0, 0, 7]);
}

#[test]
fn test_dat_emits_raw_cell() {
    assert_eq!(assemble("t", ".dat 42 .dat -1").unwrap(), vec![42, -1]);
}

#[test]
fn test_equ_binds_constant() {
    assert_eq!(
        assemble("t", ".equ ten 10 ten lit ten").unwrap(),
        vec![1, 10, 1, 10]
    );
}

#[test]
fn test_label_definition_and_backward_reference() {
    // Above the prologue area a reference is a single patched cell.
    let img = assemble("t", ".org 32 :here jump here").unwrap();
    assert_eq!(&img[32..34], &[8, 32]);
}

#[test]
fn test_forward_reference_fixup() {
    let img = assemble("t", ".org 32 jump end nop nop :end").unwrap();
    assert_eq!(&img[32..36], &[8, 36, 0, 0]);
}

#[test]
fn test_call_prologue_below_31() {
    // A bare reference in low memory compiles lit pc+3, push, jump, then
    // the patched address cell.
    let img = assemble("t", "word :word").unwrap();
    assert_eq!(img, vec![1, 3, 5, 8, 5]);
}

#[test]
fn test_no_prologue_at_31_or_above() {
    let img = assemble("t", ".org 31 word :word").unwrap();
    assert_eq!(&img[31..32], &[32]);
    assert_eq!(img.len(), 32);
}

#[test]
fn test_no_prologue_in_operand_position() {
    // In operand state only the address cell is emitted, even low.
    let img = assemble("t", "jump start :start").unwrap();
    assert_eq!(img, vec![8, 2]);
}

#[test]
fn test_local_labels_directional() {
    let img = assemble("t", ".org 32 :1 1+ :1 1-").unwrap();
    // 1+ at 32 resolves forward to the second :1 (at 33); 1- at 33
    // resolves back to that same definition.
    assert_eq!(&img[32..34], &[33, 33]);
}

#[test]
fn test_local_labels_repeated() {
    let img = assemble("t", ".org 32 :5 5- 5- :5 5-").unwrap();
    // Both early 5- hit the first :5 (32), the last hits the second (34).
    assert_eq!(&img[32..35], &[32, 32, 34]);
}

#[test]
fn test_local_and_global_labels_coexist() {
    let img = assemble("t", ".org 32 :main :2 2+ jump main :2").unwrap();
    // 2+ at 32 resolves to the second :2 at 35; jump main goes to 32.
    assert_eq!(&img[32..35], &[35, 8, 32]);
}

#[test]
fn test_unresolved_label_cites_first_use() {
    assert_asm_error(".org 32 missing", "missing label definition");
}

#[test]
fn test_empty_label_name() {
    assert_asm_error(":", "empty label name");
}

#[test]
fn test_label_redefinition() {
    assert_asm_error(".org 32 :x nop :x", "label redefinition");
}

#[test]
fn test_label_collides_with_constant() {
    assert_asm_error(".equ x 1 :x", "previously defined as a constant");
}

#[test]
fn test_equ_collides_with_label() {
    assert_asm_error(":x .equ x 1", "previously defined or used as a label");
}

#[test]
fn test_backward_local_to_undefined() {
    assert_asm_error(".org 32 5-", "backward reference to undefined local label");
}

#[test]
fn test_unknown_directive() {
    assert_asm_error(".foo", "unknown dot directive");
}

#[test]
fn test_directive_as_argument() {
    assert_asm_error("lit .org", "unexpected directive as argument");
}

#[test]
fn test_label_definition_as_argument() {
    assert_asm_error("lit :x", "unexpected label definition as argument");
}

#[test]
fn test_name_as_directive_argument() {
    assert_asm_error(".org foo", "unexpected name as directive argument");
    assert_asm_error(".equ name foo", "unexpected name as directive argument");
}

#[test]
fn test_bad_char_literal() {
    assert_asm_error("'ab'", "invalid character literal");
    assert_asm_error("'\\q'", "unknown escape");
}

#[test]
fn test_error_positions_track_lines() {
    match assemble("test", "nop\n   .bogus") {
        Err(VmError::Assembly { pos, .. }) => {
            assert_eq!((pos.line, pos.column), (2, 4));
        }
        other => panic!("expected assembly error, got {:?}", other),
    }
}

#[test]
fn test_comments_anywhere() {
    assert_eq!(
        assemble("t", "( before ) 1 ( between ) 2 ( after )").unwrap(),
        vec![1, 1, 1, 2]
    );
}

#[test]
fn test_mnemonic_in_operand_position_is_a_reference() {
    // In operand state, a word that happens to be a mnemonic is a label.
    let img = assemble("t", ".org 32 jump dup :dup").unwrap();
    assert_eq!(&img[32..34], &[8, 34]);
}

#[test]
fn test_prologue_boots_into_word() {
    // The low-memory prologue hands control to the referenced word, the
    // way boot images enter their main entry point.
    let (i, r) = run_source("main :main 5 7 +");
    r.unwrap();
    assert_eq!(i.data(), &[12]);
    assert_eq!(i.address(), &[3]);
}

#[test]
fn test_disassembly_reassembles() {
    // For label-free code, disassembling and feeding the text back to the
    // assembler reproduces the image.
    let img = assemble("t", "lit 25 dup + jump 100 0; /mod wait").unwrap();
    let image = ngaro::Image::new(img.clone());
    let mut text = String::new();
    let mut pc = 0;
    while pc < image.len() {
        let (next, line) = image.disassemble(pc);
        text.push_str(&line.replace('\t', " "));
        text.push(' ');
        pc = next;
    }
    assert_eq!(assemble("t2", &text).unwrap(), img);
}

#[test]
fn test_assembled_call_round_trip() {
    let source = "
        jump start
        .org 32
        :double dup + ;
        :start 21 double
    ";
    let (i, r) = run_source(source);
    r.unwrap();
    assert_eq!(i.data(), &[42]);
}
