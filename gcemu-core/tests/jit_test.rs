//! Compiled blocks against the interpreter, plus cache behavior.

mod utils;

use gcemu_core::cpu::exceptions::{program_cause, ExceptionFlags, INT_CAUSE_CP};
use gcemu_core::cpu::state::{msr, spr, CpuState};
use gcemu_core::session::BlockStatus;
use gcemu_core::{CoreConfig, CoreError, CoreMode, OverflowPolicy, Session};
use utils::*;

/// Run `program` on both engines after writing `vectors` into low memory.
fn run_pair(
    config: CoreConfig,
    program: &[u32],
    vectors: &[(u32, u32)],
    budget: u64,
    setup: impl Fn(&mut CpuState),
) -> (Session, Session) {
    let build = |mode| {
        let mut session = session_with_config(CoreConfig { mode, ..config.clone() }, program);
        for &(address, word) in vectors {
            session.write_u32(address, word).unwrap();
        }
        setup(session.state_mut());
        session.run(budget).unwrap();
        session
    };
    (build(CoreMode::Interpreter), build(CoreMode::Jit))
}

/// Arithmetic, compares, CR traffic, a counted loop, memory and a call.
fn mixed_program() -> Vec<u32> {
    let mut program = vec![
        li(3, 10),
        li(4, -3),
        add(5, 3, 4),
        xo_form(xo::MULLW, 6, 3, 4, false, true),
        divw(7, 3, 4),
        rlwinm(8, 6, 4, 0, 27),
        x_form(x::XOR, 8, 9, 5, true),
        cmp(1, 3, 4),
        cmpli(2, 5, 7),
        cr_logical(cr::CRAND, 0, 4, 10),
        mfcr(10),
        mtspr(9, 3),
        addi(11, 11, 1),
        bdnz(-4),
    ];
    program.extend(load_imm(12, DATA));
    program.extend([
        stw(5, 12, 0),
        lwz(13, 12, 0),
        stmw(29, 12, 8),
        lbz(14, 12, 3),
        lha(15, 12, 8),
        mfspr(16, 9),
        mfmsr(17),
        srawi(18, 4, 1, true),
        bl(8),
        HANG,
        BLR,
    ]);
    program
}

fn mixed_setup(cpu: &mut CpuState) {
    cpu.gpr[29] = 0x8000_1234;
    cpu.gpr[30] = 0xFFFF_0001;
    cpu.gpr[31] = 0x0000_7FFF;
}

#[test]
fn test_mixed_program_matches_interpreter() {
    let program = mixed_program();
    let (interpreted, compiled) =
        run_pair(test_config(CoreMode::Jit), &program, &[], 200, mixed_setup);
    assert_sessions_equal(&interpreted, &compiled, "mixed program");

    let cpu = compiled.state();
    assert_eq!(cpu.gpr[5], 7);
    assert_eq!(cpu.gpr[11], 10);
    assert_eq!(cpu.gpr[13], 7);
    assert_eq!(cpu.gpr[15], 0xFFFF_8000);
    assert_eq!(cpu.pc, BASE + 4 * (program.len() as u32 - 2));
    assert!(compiled.jit_stats().blocks_compiled > 0);
    // stmw is the only instruction routed through the interpreter
    assert_eq!(compiled.jit_stats().fallbacks_emitted, 1);
}

#[test]
fn test_disabled_groups_fall_back_transparently() {
    let program = mixed_program();
    let variants: [(&str, fn(&mut CoreConfig)); 4] = [
        ("integer", |config| config.jit.integer_off = true),
        ("load/store", |config| config.jit.load_store_off = true),
        ("system registers", |config| config.jit.system_registers_off = true),
        ("branch", |config| config.jit.branch_off = true),
    ];
    for (name, disable) in variants {
        let mut config = test_config(CoreMode::Jit);
        disable(&mut config);
        let (interpreted, compiled) = run_pair(config, &program, &[], 200, mixed_setup);
        assert_sessions_equal(&interpreted, &compiled, name);
        assert!(
            compiled.jit_stats().fallbacks_emitted > 1,
            "{} group disabled but nothing fell back",
            name
        );
    }
}

#[test]
fn test_register_pressure() {
    let program = [
        add(20, 3, 4),
        add(21, 5, 6),
        add(22, 7, 8),
        add(23, 20, 21),
        add(24, 22, 23),
        xo_form(xo::SUBF, 25, 24, 9, false, true),
        rlwimi(26, 25, 3, 0, 15),
        xo_form(xo::ADDC, 27, 10, 11, false, false),
        xo_form(xo::ADDE, 28, 12, 13, false, false),
        x_form(x::OR, 14, 3, 15, false),
        xo_form(xo::MULHWU, 16, 27, 28, false, false),
        cmp(3, 26, 25),
        HANG,
    ];
    for registers in [1, 2, 3, 11] {
        let mut config = test_config(CoreMode::Jit);
        config.jit.host_registers = registers;
        let (interpreted, compiled) = run_pair(config, &program, &[], 20, |cpu| {
            for (i, gpr) in cpu.gpr.iter_mut().enumerate() {
                *gpr = (i as u32).wrapping_mul(0x1111_1111) ^ 0x8000_0001;
            }
        });
        assert_sessions_equal(&interpreted, &compiled, &format!("{} host registers", registers));
    }
}

#[test]
fn test_operands_wider_than_host_registers_fall_back() {
    // add needs two sources, stwx three
    let program = [stwx(3, 4, 5), lwz(6, 4, 8), add(7, 3, 6), HANG];
    for registers in [1, 2] {
        let mut config = test_config(CoreMode::Jit);
        config.jit.host_registers = registers;
        config.validate().unwrap();
        let (interpreted, compiled) = run_pair(config, &program, &[], 6, |cpu| {
            cpu.gpr[3] = 0xDEAD_BEEF;
            cpu.gpr[4] = BASE + 0x200;
            cpu.gpr[5] = 8;
        });
        let message = format!("{} host registers", registers);
        assert_sessions_equal(&interpreted, &compiled, &message);
        assert_eq!(compiled.state().gpr[6], 0xDEAD_BEEF, "{}", message);
        assert_eq!(compiled.state().gpr[7], 0xDEAD_BEEFu32.wrapping_mul(2), "{}", message);
        assert!(compiled.jit_stats().fallbacks_emitted >= 1, "{}", message);
    }
}

#[test]
fn test_architectural_overflow_matches() {
    let program = [
        xo_form(xo::ADD, 5, 3, 4, true, true),
        xo_form(xo::SUBF, 6, 3, 4, true, false),
        xo_form(xo::MULLW, 7, 3, 3, true, true),
        xo_form(xo::DIVW, 8, 9, 10, true, false),
        xo_form(xo::NEG, 11, 9, 0, true, true),
        xo_form(xo::ADDME, 12, 9, 0, true, false),
        xo_form(xo::ADDZE, 13, 3, 0, true, true),
        HANG,
    ];
    let config = with_policy(OverflowPolicy::Architectural);
    let (interpreted, compiled) = run_pair(config, &program, &[], 12, |cpu| {
        cpu.gpr[3] = 0x7FFF_FFFF;
        cpu.gpr[4] = 0x0000_0001;
        cpu.gpr[9] = 0x8000_0000;
        cpu.gpr[10] = u32::MAX;
    });
    assert_sessions_equal(&interpreted, &compiled, "OE arithmetic");
    assert_ne!(compiled.state().xer_so_ov, 0);
}

#[test]
fn test_stale_handle_is_rejected() {
    let mut session = jit_session(&[li(3, 1), li(4, 2), HANG]);
    let handle = session.compile(BASE).unwrap().unwrap();
    session.write_u32(BASE + 4, li(4, 5)).unwrap();

    match session.run_compiled(handle) {
        Err(CoreError::StaleBlock { address, .. }) => assert_eq!(address, BASE),
        other => panic!("expected a stale block error, got {:?}", other),
    }
    assert_eq!(session.state().gpr[3], 0);

    // the next run recompiles the new code
    session.run(1).unwrap();
    assert_eq!(session.state().gpr[4], 5);
    assert_eq!(session.jit_stats().blocks_compiled, 2);
}

#[test]
fn test_compile_unmapped_address() {
    let mut session = jit_session(&[]);
    assert!(session.compile(0x8100_0000).unwrap().is_none());
}

#[test]
fn test_cache_statistics_and_metadata() {
    let program = [li(3, 0), li(4, 100), mtspr(9, 4), addi(3, 3, 1), bdnz(-4), HANG];
    let mut session = jit_session(&program);
    let summary = session.run(1000).unwrap();
    assert_eq!(summary.instructions, 1000);
    assert_eq!(session.state().gpr[3], 100);

    let stats = session.jit_stats();
    // entry block, loop body, idle loop
    assert_eq!(stats.blocks_compiled, 3);
    assert_eq!(stats.cache_misses, 3);
    assert_eq!(stats.cache_hits, summary.blocks - 3);
    assert_eq!(stats.blocks_run, summary.blocks);

    let blocks = session.blocks();
    let ranges: Vec<(u32, u32, u32)> = blocks
        .iter()
        .map(|block| (block.address, block.end, block.instructions))
        .collect();
    assert_eq!(
        ranges,
        vec![(BASE, BASE + 20, 5), (BASE + 12, BASE + 20, 2), (BASE + 20, BASE + 24, 1)]
    );
    assert!(blocks.iter().all(|block| block.host_ops > 0 && block.fallbacks == 0));

    match session.block_status(BASE + 4) {
        BlockStatus::Compiled(info) => assert_eq!(info.address, BASE),
        BlockStatus::NotCompiled => panic!("BASE + 4 should be compiled"),
    }
    assert_eq!(session.block_status(BASE + 0x100), BlockStatus::NotCompiled);
}

#[test]
fn test_store_into_own_block() {
    // overwrite the `li r7, 1` that follows the store with `li r7, 99`
    let mut program = load_imm(5, li(7, 99)).to_vec();
    program.extend(load_imm(6, BASE + 20));
    program.extend([stw(5, 6, 0), li(7, 1), HANG]);

    let (interpreted, compiled) = run_both(&program, |_| {});
    assert_eq!(interpreted.state().gpr[7], 99);
    assert_sessions_equal(&interpreted, &compiled, "self-modifying store");
    assert!(compiled.jit_stats().invalidations >= 1);
}

#[test]
fn test_store_into_other_block_invalidates_it() {
    // first pass runs the callee, then patches it and calls again
    let mut program = load_imm(5, li(3, 42)).to_vec();
    program.extend(load_imm(6, BASE + 40));
    program.extend([
        bl(20),          // +16: call the callee at +36
        stw(5, 6, 0),    // +20
        li(8, 0),        // +24
        bl(8),           // +28: call again
        HANG,            // +32
        li(3, 7),        // +36: callee
        li(3, 1),        // +40: patched to li r3, 42
        BLR,             // +44
    ]);
    let (interpreted, compiled) = run_both(&program, |_| {});
    assert_eq!(interpreted.state().gpr[3], 42);
    assert_sessions_equal(&interpreted, &compiled, "cross-block patch");
}

#[test]
fn test_data_storage_exception_in_block() {
    let mut program = vec![li(3, 5)];
    program.extend(load_imm(4, 0x8100_0000));
    program.extend([lwz(5, 4, 8), li(6, 1), HANG]);
    let (interpreted, compiled) = run_pair(
        test_config(CoreMode::Jit),
        &program,
        &[(0x300, HANG)],
        program.len() as u64 + 4,
        |_| {},
    );
    assert_sessions_equal(&interpreted, &compiled, "DSI");

    let cpu = compiled.state();
    assert_eq!(cpu.pc, 0x300);
    assert_eq!(cpu.spr[spr::SRR0], BASE + 12);
    assert_eq!(cpu.spr[spr::DAR], 0x8100_0008);
    assert_eq!(cpu.gpr[3], 5);
    assert_eq!(cpu.gpr[6], 0);
}

#[test]
fn test_instruction_storage_exception_from_dispatcher() {
    let mut session = jit_session(&[]);
    session.write_u32(0x400, HANG).unwrap();
    session.state_mut().set_pc(0x8100_0000);
    let summary = session.run(3).unwrap();
    assert_eq!(summary.exceptions, 1);
    assert_eq!(session.state().pc, 0x400);
    assert_eq!(session.state().spr[spr::SRR0], 0x8100_0000);
}

#[test]
fn test_trap_and_invalid_in_block() {
    let program = [li(4, 3), tw(4, 4, 4), li(5, 1), HANG];
    let (interpreted, compiled) =
        run_pair(test_config(CoreMode::Jit), &program, &[(0x700, HANG)], 8, |_| {});
    assert_sessions_equal(&interpreted, &compiled, "trap");
    assert_eq!(compiled.state().pc, 0x700);
    assert_eq!(
        compiled.state().spr[spr::SRR1] & program_cause::MASK,
        program_cause::TRAP
    );

    // a floating-point add is not part of the integer core
    let program = [li(4, 3), 0xFC22_182A, HANG];
    let (interpreted, compiled) =
        run_pair(test_config(CoreMode::Jit), &program, &[(0x700, HANG)], 8, |_| {});
    assert_sessions_equal(&interpreted, &compiled, "invalid");
    assert_eq!(
        compiled.state().spr[spr::SRR1] & program_cause::MASK,
        program_cause::ILLEGAL
    );
}

#[test]
fn test_mtmsr_exit_delivers_external() {
    let program = [mtmsr(3), li(4, 1), HANG];
    let (interpreted, compiled) = run_pair(
        test_config(CoreMode::Jit),
        &program,
        &[(0x500, HANG)],
        6,
        |cpu| {
            cpu.gpr[3] = msr::EE;
            cpu.exceptions.insert(ExceptionFlags::EXTERNAL_INT);
        },
    );
    assert_sessions_equal(&interpreted, &compiled, "mtmsr");
    let cpu = compiled.state();
    assert_eq!(cpu.pc, 0x500);
    assert_eq!(cpu.spr[spr::SRR0], BASE + 4);
    assert_eq!(cpu.gpr[4], 0);
}

#[test]
fn test_mtmsr_exit_defers_command_processor() {
    let mut session = jit_session(&[mtmsr(3), li(4, 1), HANG]);
    session.write_u32(0x500, HANG).unwrap();
    session.state_mut().gpr[3] = msr::EE;
    session.state_mut().exceptions.insert(ExceptionFlags::EXTERNAL_INT);
    let signal = session.exception_signal();
    signal.set_interrupt_cause(INT_CAUSE_CP);

    session.run(2).unwrap();
    assert_eq!(session.state().gpr[4], 1);
    assert_eq!(session.state().pc, BASE + 8);
    assert!(session.state().exceptions.contains(ExceptionFlags::EXTERNAL_INT));

    signal.request_check();
    let summary = session.run(1).unwrap();
    assert_eq!(summary.exceptions, 1);
    assert_eq!(session.state().pc, 0x500);
    assert_eq!(session.state().spr[spr::SRR0], BASE + 8);
}

#[test]
fn test_system_call_round_trip() {
    let program = [SC, li(3, 7), HANG];
    let (interpreted, compiled) =
        run_pair(test_config(CoreMode::Jit), &program, &[(0xC00, RFI)], 7, |cpu| {
            cpu.msr = msr::EE;
        });
    assert_sessions_equal(&interpreted, &compiled, "sc/rfi");
    assert_eq!(compiled.state().gpr[3], 7);
    assert_eq!(compiled.state().msr & msr::EE, msr::EE);
    assert_eq!(compiled.state().pc, BASE + 8);
}
