use stacktrace::unwind::{FramePointerUnwinder, MachineContext, StackBounds};
use stacktrace::{Address, MachineType, StackTrace, SymbolResolver, MAX_TRACES};

fn names(trace: &StackTrace) -> Vec<String> {
    let resolver = SymbolResolver::new();
    assert!(resolver.init_error().is_none(), "resolver failed: {:?}", resolver.init_error());
    trace
        .addresses()
        .iter()
        .map(|&addr| resolver.resolve(addr).symbol.map(|s| s.name).unwrap_or_default())
        .collect()
}

#[inline(never)]
fn level_three() -> StackTrace {
    let trace = StackTrace::capture();
    std::hint::black_box(trace)
}

#[inline(never)]
fn level_two() -> StackTrace {
    std::hint::black_box(level_three())
}

#[inline(never)]
fn level_one() -> StackTrace {
    std::hint::black_box(level_two())
}

#[test]
fn test_capture_lists_callers_innermost_first() {
    let trace = level_one();
    let names = names(&trace);

    assert!(trace.len() >= 4, "trace too short: {names:?}");
    assert!(trace.len() <= MAX_TRACES);
    assert!(names[0].ends_with("level_three"), "{names:?}");
    assert!(names[1].ends_with("level_two"), "{names:?}");
    assert!(names[2].ends_with("level_one"), "{names:?}");
    assert!(names[3].ends_with("test_capture_lists_callers_innermost_first"), "{names:?}");
}

#[inline(never)]
fn walk_from_deeper(ctx: &MachineContext) -> StackTrace {
    std::hint::black_box(StackTrace::from_context(ctx))
}

#[inline(never)]
fn with_saved_context() -> StackTrace {
    let ctx = MachineContext::capture().expect("capture is supported on this target");
    std::hint::black_box(walk_from_deeper(&ctx))
}

#[test]
fn test_from_context_starts_at_saved_pc() {
    let trace = with_saved_context();
    let names = names(&trace);

    assert!(trace.len() >= 2, "trace too short: {names:?}");
    assert!(names[0].ends_with("with_saved_context"), "{names:?}");
    assert!(names[1].ends_with("test_from_context_starts_at_saved_pc"), "{names:?}");
    // The frame that built the trace is not part of the saved chain
    assert!(!names.iter().any(|name| name.ends_with("walk_from_deeper")), "{names:?}");
}

#[inline(never)]
fn unrelated_a() -> u64 {
    std::hint::black_box(1)
}

#[inline(never)]
fn unrelated_b() -> u64 {
    std::hint::black_box(2)
}

#[inline(never)]
fn unrelated_c() -> u64 {
    std::hint::black_box(3)
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_saved_context_yields_its_own_chain() {
    // A fabricated stack: c was called by b, which was called by a
    let mut stack = vec![0u64; 16];
    let base = stack.as_ptr() as u64;
    let ret_into_b = unrelated_b as usize as u64 + 1;
    let ret_into_a = unrelated_a as usize as u64 + 1;
    stack[0] = base + 32;
    stack[1] = ret_into_b;
    stack[4] = 0;
    stack[5] = ret_into_a;

    let machine = MachineType::host().expect("supported target");
    let ctx = MachineContext::new(machine, unrelated_c as usize as u64, base, base);
    let mut unwinder = FramePointerUnwinder::new(StackBounds::of_slice(&stack));
    let trace: StackTrace = StackTrace::walk(&ctx, &mut unwinder);

    #[allow(clippy::cast_possible_truncation)]
    let expected = [
        Address(unrelated_c as usize),
        Address(ret_into_b as usize),
        Address(ret_into_a as usize),
    ];
    assert_eq!(trace.addresses(), &expected);

    let names = names(&trace);
    assert!(names[0].ends_with("unrelated_c"), "{names:?}");
    assert!(names[1].ends_with("unrelated_b"), "{names:?}");
    assert!(names[2].ends_with("unrelated_a"), "{names:?}");
}

#[inline(never)]
fn recurse(depth: usize) -> StackTrace<8> {
    if depth == 0 {
        return StackTrace::capture();
    }
    std::hint::black_box(recurse(std::hint::black_box(depth - 1)))
}

#[test]
fn test_deep_stack_is_cut_at_capacity() {
    let trace = recurse(20);

    assert_eq!(trace.len(), 8);
    assert_eq!(trace.capacity(), 8);
    assert_eq!(trace.addresses().len(), 8);
}

#[test]
fn test_traces_are_plain_values() {
    let first = level_one();
    let copy = first;

    assert_eq!(first, copy);
    assert_eq!(first.addresses(), copy.addresses());
}
