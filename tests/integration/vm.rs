//! Engine tests: per-opcode stack effects, calls, errors, the tick
//! callback and the stop signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ngaro::{Cell, Image, Instance, Opcode, StackId, VmConfig, VmError, CELL_BITS};

use crate::common::{check, instance, run_source, setup};

#[test]
fn test_nop() {
    let mut p = setup(&[0, 0], &[7], &[]);
    check(&mut p, 0, &[7], &[]);
}

#[test]
fn test_lit() {
    let mut p = setup(&[1, 25], &[], &[]);
    check(&mut p, 0, &[25], &[]);
}

#[test]
fn test_dup() {
    let mut p = setup(&[2], &[0, 42], &[]);
    check(&mut p, 0, &[0, 42, 42], &[]);
}

#[test]
fn test_drop() {
    let mut p = setup(&[3], &[0, 42], &[]);
    check(&mut p, 0, &[0], &[]);
}

#[test]
fn test_swap() {
    let mut p = setup(&[4], &[0, 42], &[]);
    check(&mut p, 0, &[42, 0], &[]);
}

#[test]
fn test_push() {
    let mut p = setup(&[5], &[42], &[]);
    check(&mut p, 0, &[], &[42]);
}

#[test]
fn test_pop() {
    let mut p = setup(&[6], &[], &[42]);
    check(&mut p, 0, &[42], &[]);
}

#[test]
fn test_loop() {
    // Counter still positive: jump (even past the image end) and keep it.
    let mut p = setup(&[7, 100], &[2], &[]);
    check(&mut p, 100, &[1], &[]);

    // Counter exhausted: drop it and fall through.
    let mut p = setup(&[7, 100], &[1], &[]);
    check(&mut p, 2, &[], &[]);
}

#[test]
fn test_loop_keeps_decremented_counter() {
    // LOOP 4; LIT 0; LIT 1 with 43 on the stack: one iteration lands on
    // the second literal.
    let mut p = setup(&[7, 4, 1, 0, 1, 1], &[43], &[]);
    check(&mut p, 0, &[42, 1], &[]);
}

#[test]
fn test_jump() {
    let mut p = setup(&[8, 100], &[], &[]);
    check(&mut p, 100, &[], &[]);
}

#[test]
fn test_return() {
    // RETURN resumes after the call cell.
    let mut p = setup(&[9, 0, 1, 7], &[], &[1]);
    check(&mut p, 0, &[7], &[]);
}

fn check_comparison(op: Opcode, stack: &[Cell], taken: bool) {
    // [op, 4, jump, 7, lit, 99]: the taken path pushes 99 and exits at the
    // image end, the fall-through jumps out at 7. Both comparands drop.
    let code = [op.code(), 4, 8, 7, 1, 99];
    let mut p = setup(&code, stack, &[]);
    if taken {
        check(&mut p, 0, &[99], &[]);
    } else {
        check(&mut p, 7, &[], &[]);
    }
}

#[test]
fn test_comparison_jumps() {
    check_comparison(Opcode::GtJump, &[5, 3], true);
    check_comparison(Opcode::GtJump, &[3, 5], false);
    check_comparison(Opcode::LtJump, &[3, 5], true);
    check_comparison(Opcode::LtJump, &[5, 3], false);
    check_comparison(Opcode::NeJump, &[1, 2], true);
    check_comparison(Opcode::NeJump, &[2, 2], false);
    check_comparison(Opcode::EqJump, &[2, 2], true);
    check_comparison(Opcode::EqJump, &[1, 2], false);
}

#[test]
fn test_fetch_store() {
    let mut code = vec![0 as Cell; 32];
    // 5 30 ! 30 @
    code[..8].copy_from_slice(&[1, 5, 1, 30, 15, 1, 30, 14]);
    let mut p = setup(&code, &[], &[]);
    check(&mut p, 0, &[5], &[]);
    assert_eq!(p.image[30], 5);
}

#[test]
fn test_fetch_out_of_bounds() {
    let mut p = setup(&[1, 500, 14], &[], &[]);
    match p.run() {
        Err(VmError::MemoryBounds { address, pc, .. }) => {
            assert_eq!(address, 500);
            assert_eq!(pc, 2);
        }
        other => panic!("expected bounds error, got {:?}", other),
    }
    // Faulting state is preserved for introspection.
    assert_eq!(p.pc(), 2);
}

#[test]
fn test_arithmetic() {
    let mut p = setup(&[16], &[5, 7], &[]);
    check(&mut p, 0, &[12], &[]);
    let mut p = setup(&[17], &[5, 7], &[]);
    check(&mut p, 0, &[-2], &[]);
    let mut p = setup(&[18], &[5, 7], &[]);
    check(&mut p, 0, &[35], &[]);
}

#[test]
fn test_dimod() {
    // ( a b — a%b a/b ), sign follows the dividend.
    let mut p = setup(&[19], &[17, 5], &[]);
    check(&mut p, 0, &[2, 3], &[]);
    let mut p = setup(&[19], &[-7, 2], &[]);
    check(&mut p, 0, &[-1, -3], &[]);
}

#[test]
fn test_dimod_by_zero() {
    let mut p = setup(&[19], &[1, 0], &[]);
    assert!(matches!(
        p.run(),
        Err(VmError::DivisionByZero { pc: 0 })
    ));
}

#[test]
fn test_bitwise() {
    let mut p = setup(&[20], &[0b1100, 0b1010], &[]);
    check(&mut p, 0, &[0b1000], &[]);
    let mut p = setup(&[21], &[0b1100, 0b1010], &[]);
    check(&mut p, 0, &[0b1110], &[]);
    let mut p = setup(&[22], &[0b1100, 0b1010], &[]);
    check(&mut p, 0, &[0b0110], &[]);
}

#[test]
fn test_shifts() {
    let mut p = setup(&[23], &[1, 4], &[]);
    check(&mut p, 0, &[16], &[]);
    let mut p = setup(&[24], &[-16, 2], &[]);
    check(&mut p, 0, &[-4], &[]);
    // Shift counts land in the low 8 bits and do not wrap the width.
    let mut p = setup(&[23], &[1, CELL_BITS as Cell], &[]);
    check(&mut p, 0, &[0], &[]);
}

#[test]
fn test_zero_exit() {
    let mut code = vec![0 as Cell; 8];
    code[0] = 25;
    let mut p = setup(&code, &[0], &[5]);
    check(&mut p, 0, &[], &[]);

    let mut p = setup(&code, &[7], &[]);
    check(&mut p, 0, &[7], &[]);
}

#[test]
fn test_inc_dec() {
    let mut p = setup(&[26, 26, 27], &[10], &[]);
    check(&mut p, 0, &[11], &[]);
}

#[test]
fn test_call_via_unknown_opcode() {
    // Any cell value outside the known set is a call: the prior PC lands
    // on the address stack and execution continues at the cell's value.
    let mut code = vec![0 as Cell; 40];
    code[0] = 35;
    let mut p = setup(&code, &[], &[]);
    check(&mut p, 0, &[], &[0]);
}

#[test]
fn test_call_and_return_via_unknown_opcode() {
    let mut code = vec![0 as Cell; 40];
    code[0] = 33; // call 33
    code[1] = 8; // jump out on return
    code[2] = 100;
    code[33] = 1; // lit 42
    code[34] = 42;
    code[35] = 9; // return
    let mut p = setup(&code, &[], &[]);
    check(&mut p, 100, &[42], &[]);
}

#[test]
fn test_explicit_call_opcode() {
    let config = VmConfig {
        extended_ops: true,
        ..VmConfig::default()
    };
    let mut code = vec![0 as Cell; 16];
    code[0] = 31; // call 4
    code[1] = 4;
    code[2] = 8; // jump out on return
    code[3] = 100;
    code[4] = 1; // lit 42
    code[5] = 42;
    code[6] = 9; // return
    let mut i = Instance::new(Image::new(code), "unused-image", config);
    let last = i.run().unwrap();
    assert_eq!(last, 100);
    assert_eq!(i.data(), &[42]);
}

#[test]
fn test_extended_opcodes_stay_calls_by_default() {
    // Without extended_ops, cell value 31 is a call like any other.
    let mut code = vec![0 as Cell; 34];
    code[0] = 31;
    let mut p = setup(&code, &[], &[]);
    check(&mut p, 0, &[], &[0]);
}

#[test]
#[cfg(not(feature = "cell32"))]
fn test_float_arithmetic() {
    use ngaro::core::cell::{cell_to_float, float_to_cell};

    let config = VmConfig {
        extended_ops: true,
        ..VmConfig::default()
    };
    // f+ then f* on literals.
    let code = vec![
        1,
        float_to_cell(1.5),
        1,
        float_to_cell(2.25),
        32, // f+
        1,
        float_to_cell(2.0),
        34, // f*
    ];
    let mut i = Instance::new(Image::new(code), "unused-image", config);
    i.run().unwrap();
    assert_eq!(i.data().len(), 1);
    assert_eq!(cell_to_float(i.tos()), 7.5);
}

#[test]
#[cfg(not(feature = "cell32"))]
fn test_float_conversions_and_jumps() {
    use ngaro::core::cell::float_to_cell;

    let config = VmConfig {
        extended_ops: true,
        ..VmConfig::default()
    };
    // 3 >f 2.5 f>jump 8 (taken), target pushes the integer view of 3.0.
    let code = vec![
        1,
        3,
        36, // >f
        1,
        float_to_cell(2.5),
        38, // f>jump
        8,
        0,
        1,
        float_to_cell(3.0),
        37, // f>
    ];
    let mut i = Instance::new(Image::new(code), "unused-image", config);
    i.run().unwrap();
    assert_eq!(i.data(), &[3]);
}

#[test]
fn test_custom_opcode_handler() {
    let mut p = setup(&[-3], &[], &[]);
    p.set_opcode_handler(Box::new(|vm, op| {
        vm.push(-op)?;
        Ok(())
    }));
    let last = p.run().unwrap();
    assert_eq!(last, 1);
    assert_eq!(p.data(), &[3]);
}

#[test]
fn test_negative_opcode_without_handler() {
    let mut p = setup(&[-5], &[], &[]);
    assert!(matches!(
        p.run(),
        Err(VmError::InvalidOpcode { opcode: -5, pc: 0 })
    ));
}

#[test]
fn test_stack_overflow_carries_identity_and_pc() {
    let config = VmConfig {
        data_size: 2,
        ..VmConfig::default()
    };
    let code = vec![1, 10, 1, 20, 1, 30];
    let mut i = Instance::new(Image::new(code), "unused-image", config);
    match i.run() {
        Err(VmError::StackOverflow { stack, pc }) => {
            assert_eq!(stack, StackId::Data);
            assert_eq!(pc, 4);
        }
        other => panic!("expected overflow, got {:?}", other),
    }
}

#[test]
fn test_loose_underflow() {
    // DROP, TOS reads and POP on empty stacks yield zeros, no error.
    let mut p = setup(&[3, 2, 6], &[], &[]);
    check(&mut p, 0, &[0, 0], &[]);
}

#[test]
fn test_instruction_count() {
    let mut p = setup(&[0, 0, 1, 7, 16], &[], &[]);
    p.run().unwrap();
    assert_eq!(p.instruction_count(), 4);
}

#[test]
fn test_tick_callback() {
    let config = VmConfig {
        tick_shift: Some(1),
        ..VmConfig::default()
    };
    let code = vec![0 as Cell; 8];
    let mut i = Instance::new(Image::new(code), "unused-image", config);
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    i.set_tick(Box::new(move |_vm| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    i.run().unwrap();
    // Every 2nd instruction: counts 0, 2, 4 and 6.
    assert_eq!(ticks.load(Ordering::SeqCst), 4);
}

#[test]
fn test_stop_signal_before_run() {
    let mut p = setup(&[8, 0], &[], &[]);
    let handle = p.stop_handle();
    handle.stop();
    let last = p.run().unwrap();
    assert_eq!(last, 0);
    assert!(p.stopped());
}

#[test]
fn test_stop_signal_from_another_thread() {
    // An infinite jump loop, interrupted cooperatively.
    let mut p = setup(&[8, 0], &[], &[]);
    let handle = p.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.stop();
    });
    p.run().unwrap();
    assert!(p.stopped());
    stopper.join().unwrap();
}

#[test]
fn test_negative_jump_target_errors() {
    let mut p = setup(&[8, -4], &[], &[]);
    assert!(matches!(p.run(), Err(VmError::PcOutOfRange { .. })));
}

#[test]
fn test_lit_at_image_end_errors() {
    let mut p = setup(&[1], &[], &[]);
    assert!(matches!(p.run(), Err(VmError::PcOutOfRange { pc: 1 })));
}

// Assembled end-to-end scenarios.

#[test]
fn test_arithmetic_scenario() {
    let (i, r) = run_source("5 7 +");
    r.unwrap();
    assert_eq!(i.data(), &[12]);
}

#[test]
fn test_fibonacci_iterative() {
    let source = "
        jump start
        .org 32
        :start
          0 100 !
          1 101 !
        :loop
          dup 1 >jump 0+
          jump done
        :0
          100 @ 101 @ dup push + 101 ! pop 100 ! 1- jump loop
        :done
          drop 101 @
    ";
    let mut i = instance(source);
    i.push(30).unwrap();
    i.run().unwrap();
    assert_eq!(i.data(), &[832040]);
}
