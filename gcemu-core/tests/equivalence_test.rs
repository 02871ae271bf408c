//! Random instruction sequences must leave identical state on both engines.

mod utils;

use gcemu_core::config::MAX_HOST_REGISTERS;
use gcemu_core::{CoreMode, OverflowPolicy};
use proptest::prelude::*;
use utils::*;

fn reg() -> impl Strategy<Value = u32> {
    0u32..32
}

fn arithmetic() -> impl Strategy<Value = u32> {
    (prop::sample::select(xo::ALL.to_vec()), reg(), reg(), reg(), any::<bool>(), any::<bool>())
        .prop_map(|(op, rd, ra, rb, oe, rc)| {
            let unary = matches!(op, xo::NEG | xo::ADDME | xo::ADDZE | xo::SUBFME | xo::SUBFZE);
            let oe = oe && !matches!(op, xo::MULHW | xo::MULHWU);
            xo_form(op, rd, ra, if unary { 0 } else { rb }, oe, rc)
        })
}

fn logical() -> impl Strategy<Value = u32> {
    prop_oneof![
        (prop::sample::select(x::BINARY.to_vec()), reg(), reg(), reg(), any::<bool>())
            .prop_map(|(op, rs, ra, rb, rc)| x_form(op, rs, ra, rb, rc)),
        (prop::sample::select(x::UNARY.to_vec()), reg(), reg(), any::<bool>())
            .prop_map(|(op, rs, ra, rc)| x_form(op, rs, ra, 0, rc)),
        (reg(), reg(), 0u32..32, any::<bool>()).prop_map(|(ra, rs, sh, rc)| srawi(ra, rs, sh, rc)),
        // rlwimi, rlwinm, rlwnm
        (prop::sample::select(vec![20u32, 21, 23]), reg(), reg(), 0u32..32, 0u32..32, 0u32..32, any::<bool>())
            .prop_map(|(opcd, ra, rs, sh, mb, me, rc)| rotate(opcd, ra, rs, sh, mb, me, rc)),
    ]
}

fn immediate() -> impl Strategy<Value = u32> {
    // mulli, subfic, addic, addic., addi, addis, ori, oris, xori, xoris, andi., andis.
    let opcodes = vec![7u32, 8, 12, 13, 14, 15, 24, 25, 26, 27, 28, 29];
    (prop::sample::select(opcodes), reg(), reg(), any::<u16>())
        .prop_map(|(opcd, rd, ra, imm)| d_form(opcd, rd, ra, imm))
}

fn compare() -> impl Strategy<Value = u32> {
    prop_oneof![
        (0u32..8, reg(), reg()).prop_map(|(crf, ra, rb)| cmp(crf, ra, rb)),
        (0u32..8, reg(), reg()).prop_map(|(crf, ra, rb)| cmpl(crf, ra, rb)),
        (0u32..8, reg(), any::<i16>()).prop_map(|(crf, ra, simm)| cmpi(crf, ra, simm)),
        (0u32..8, reg(), any::<u16>()).prop_map(|(crf, ra, uimm)| cmpli(crf, ra, uimm)),
    ]
}

fn condition_register() -> impl Strategy<Value = u32> {
    prop_oneof![
        (prop::sample::select(cr::ALL.to_vec()), 0u32..32, 0u32..32, 0u32..32)
            .prop_map(|(op, d, a, b)| cr_logical(op, d, a, b)),
        (0u32..8, 0u32..8).prop_map(|(d, s)| mcrf(d, s)),
        (0u32..256, reg()).prop_map(|(crm, rs)| mtcrf(crm, rs)),
        reg().prop_map(mfcr),
    ]
}

fn special_register() -> impl Strategy<Value = u32> {
    // XER, LR, CTR, SPRG0-3
    let sprs = vec![1u32, 8, 9, 272, 273, 274, 275];
    prop_oneof![
        (reg(), prop::sample::select(sprs.clone())).prop_map(|(rd, spr)| mfspr(rd, spr)),
        (prop::sample::select(sprs), reg()).prop_map(|(spr, rs)| mtspr(spr, rs)),
        reg().prop_map(mfmsr),
    ]
}

fn instruction() -> impl Strategy<Value = u32> {
    prop_oneof![
        4 => arithmetic(),
        3 => logical(),
        3 => immediate(),
        2 => compare(),
        2 => condition_register(),
        1 => special_register(),
    ]
}

fn policy() -> impl Strategy<Value = OverflowPolicy> {
    prop_oneof![Just(OverflowPolicy::Ignore), Just(OverflowPolicy::Architectural)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_engines_agree(
        body in prop::collection::vec(instruction(), 1..48),
        gprs in prop::array::uniform32(any::<u32>()),
        xer in any::<u32>(),
        cr_value in any::<u32>(),
        host_registers in 1usize..=MAX_HOST_REGISTERS,
        overflow_policy in policy(),
    ) {
        let mut program = body.clone();
        program.push(HANG);

        let mut config = test_config(CoreMode::Jit);
        config.jit.host_registers = host_registers;
        config.overflow_policy = overflow_policy;
        let budget = program.len() as u64 + 2;

        let (interpreted, compiled) = run_both_with(config, &program, budget, |cpu| {
            cpu.gpr = gprs;
            cpu.set_xer(xer);
            cpu.cr.set(cr_value);
        });
        assert_sessions_equal(
            &interpreted,
            &compiled,
            &format!("{} registers, {:?}, program {:08X?}", host_registers, overflow_policy, body),
        );
    }

    #[test]
    fn prop_block_splits_do_not_matter(
        body in prop::collection::vec(instruction(), 8..40),
        gprs in prop::array::uniform32(any::<u32>()),
        max_block in 1usize..8,
    ) {
        let mut program = body;
        program.push(HANG);

        let mut config = test_config(CoreMode::Jit);
        config.jit.max_block_instructions = max_block;
        let budget = program.len() as u64 + 2;

        let (interpreted, compiled) = run_both_with(config, &program, budget, |cpu| cpu.gpr = gprs);
        assert_sessions_equal(&interpreted, &compiled, &format!("blocks of {}", max_block));
    }
}
