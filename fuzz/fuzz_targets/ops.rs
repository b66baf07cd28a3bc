#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segregated_fit_fuzzing::Ops;

/// How far the heap's arena may grow. Small enough that the fuzzer regularly
/// drives the heap to exhaustion.
const ARENA_CAPACITY: usize = 1 << 20;

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Occasionally let libFuzzer mutate the raw bytes instead.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = Ops::decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    session
        .mutate(&mut ops)
        .ok()
        .and_then(|()| ops.encode_into(data))
        .unwrap_or_else(|| fuzzer_mutate(data, size, max_size))
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = Ops::decode(data) else {
        return;
    };
    log::debug!("running {} heap operations", ops.len());
    if let Err(e) = ops.run(ARENA_CAPACITY) {
        panic!("heap operations failed: {e}");
    }
});
