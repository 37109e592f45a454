//! End-to-end tests: full source programs through the pipeline, executed in
//! the IR interpreter, with spot checks on the emitted assembly.

use pretty_assertions::assert_eq;

use wlpc::driver::{compile, compile_to_cfg};
use wlpc::ir::interp::{run_with_array, run_with_ints};
use wlpc::ir::ir::Opcode;

const PRIMES_AND_COLLATZ: &str = r"
// Computes 1 when n is prime.
int isPrime(int n) {
    int i = 2;
    int answer = 1;
    int continueLooping = 1;

    if (n <= 3) {
        continueLooping = 0;
    } else {
    }
    while (continueLooping != 0) {
        if (n % i == 0) {
            answer = 0;
        } else {
        }
        i = i + 1;
        if (i * i > n) {
            continueLooping = 0;
        } else {
            if (answer == 0) {
                continueLooping = 0;
            } else {
            }
        }
    }
    return answer;
}

// One Collatz step on the integer pointed to by num.
int collatz(int* num) {
    int value = 0;
    value = *num;
    if (value >= 2) {
        if (value % 2 != 0) {
            *num = 3 * value + 2 - 1;
        } else {
            *num = value / 2;
        }
    } else {
        *num = 1;
    }
    return 0;
}

int wain(int numPrimes, int startNumber) {
    int* result = NULL;
    int idx = 0;
    int nextNumber = 0;
    result = new int[numPrimes];
    nextNumber = startNumber;

    while (idx < numPrimes) {
        while (isPrime(nextNumber) == 0) {
            nextNumber = nextNumber + 1;
        }
        *(result + idx) = nextNumber;
        nextNumber = nextNumber + 1;
        idx = idx + 1;
    }

    idx = 0;
    while (idx < numPrimes) {
        println(*(result + idx));
        idx = idx + 1;
    }

    nextNumber = 40;
    while (nextNumber != 1) {
        println(nextNumber);
        idx = collatz(&nextNumber);
    }

    delete [] result;
    return 0;
}
";

#[test]
fn scenario_integer_sum() {
    let program = compile_to_cfg("int wain(int a, int b) { return a + b; }", true).unwrap();
    let (result, output) = run_with_ints(&program, 3, 4).unwrap();
    assert_eq!(result.return_value, 7);
    assert_eq!(output, "");
}

#[test]
fn scenario_primes_and_collatz() {
    for optimize in [false, true] {
        let program = compile_to_cfg(PRIMES_AND_COLLATZ, optimize).unwrap();
        let (result, output) = run_with_ints(&program, 3, 2).unwrap();
        assert_eq!(result.return_value, 0, "optimize = {optimize}");
        let expected: Vec<String> = [2, 3, 5, 40, 20, 10, 5, 16, 8, 4, 2]
            .iter()
            .map(|n| n.to_string())
            .collect();
        let printed: Vec<String> = output.lines().map(str::to_string).collect();
        assert_eq!(printed, expected, "optimize = {optimize}");
        assert_eq!(result.leaked_blocks, 0, "optimize = {optimize}");
    }
}

#[test]
fn scenario_allocate_write_free() {
    let source = "
        int wain(int a, int b) {
            int* p = NULL;
            p = new int[3];
            *p = 42;
            println(*p);
            delete [] p;
            return 0;
        }
    ";
    let program = compile_to_cfg(source, true).unwrap();
    let (result, output) = run_with_ints(&program, 1, 1).unwrap();
    assert_eq!(result.return_value, 0);
    assert_eq!(output, "42\n");
    assert_eq!(result.leaked_blocks, 0);
}

#[test]
fn scenario_null_delete_is_guarded() {
    let source = "int wain(int a, int b) { int* p = NULL; delete [] p; return 0; }";

    // The interpreter skips the free outright.
    let program = compile_to_cfg(source, true).unwrap();
    let (result, _) = run_with_ints(&program, 1, 1).unwrap();
    assert_eq!(result.return_value, 0);

    // The emitted code compares against the sentinel register before the
    // runtime call.
    let text = compile(source, true).unwrap();
    let guard = text
        .lines()
        .position(|line| line.contains("$11, deleteSkip0"))
        .expect("a branch against the sentinel register");
    let call = text.lines().position(|line| line.contains(".word delete")).unwrap();
    assert!(guard < call, "the sentinel check must precede the delete call:\n{text}");
}

#[test]
fn scenario_inlining_eliminates_calls() {
    let source = "
        int square(int n) { return n * n; }
        int wain(int a, int b) { return square(a) + square(b); }
    ";
    let program = compile_to_cfg(source, true).unwrap();
    let mut calls = 0;
    program.wain().for_each_instruction(|instruction| {
        if instruction.opcode == Opcode::Call {
            calls += 1;
        }
    });
    assert_eq!(calls, 0, "both calls to square should be inlined");

    let (result, _) = run_with_ints(&program, 3, 4).unwrap();
    assert_eq!(result.return_value, 25);
}

#[test]
fn scenario_register_spills() {
    // Forty simultaneously-live values overwhelm the 22-register palette.
    let mut source = String::from("int wain(int a, int b) {\nint total = 0;\n");
    for idx in 0..40 {
        source.push_str(&format!("int v{idx} = 0;\n"));
    }
    for idx in 0..40 {
        source.push_str(&format!("v{idx} = a + {idx};\n"));
    }
    source.push_str("total = b");
    for idx in 0..40 {
        source.push_str(&format!(" + v{idx}"));
    }
    source.push_str(";\nreturn total;\n}\n");

    let program = compile_to_cfg(&source, true).unwrap();
    let (result, _) = run_with_ints(&program, 0, 0).unwrap();
    assert_eq!(result.return_value, (0..40).sum::<i32>());

    let text = compile(&source, true).unwrap();
    let has_spill_store = text.lines().any(|line| line.trim_start().starts_with("sw") && line.contains("($29)"));
    let has_spill_load = text.lines().any(|line| line.trim_start().starts_with("lw") && line.contains("($29)"));
    assert!(has_spill_store && has_spill_load, "spill traffic expected:\n{text}");
}

#[test]
fn array_arguments_flow_through_wain() {
    let source = "
        int wain(int* values, int count) {
            int i = 0;
            int total = 0;
            while (i < count) {
                total = total + *(values + i);
                i = i + 1;
            }
            return total;
        }
    ";
    let program = compile_to_cfg(source, true).unwrap();
    let (result, _) = run_with_array(&program, &[2, 4, 6, 8]).unwrap();
    assert_eq!(result.return_value, 20);
}

#[test]
fn optimized_and_unoptimized_agree() {
    let source = "
        int gcd(int a, int b) {
            int result = 0;
            if (b == 0) {
                result = a;
            } else {
                result = gcd(b, a % b);
            }
            return result;
        }
        int wain(int a, int b) { return gcd(a, b); }
    ";
    let plain = compile_to_cfg(source, false).unwrap();
    let optimized = compile_to_cfg(source, true).unwrap();
    for (a, b) in [(12, 18), (35, 14), (7, 0), (0, 9)] {
        let (plain_result, _) = run_with_ints(&plain, a, b).unwrap();
        let (optimized_result, _) = run_with_ints(&optimized, a, b).unwrap();
        assert_eq!(plain_result.return_value, optimized_result.return_value, "gcd({a}, {b})");
    }
}

#[test]
fn ssa_invariants_hold_after_optimization() {
    let program = compile_to_cfg(PRIMES_AND_COLLATZ, true).unwrap();
    for function in program.functions.values() {
        if function.uses_memory() {
            continue;
        }
        // Single static assignment, counting parameters.
        let mut seen: std::collections::BTreeSet<String> =
            function.parameters.iter().map(|p| p.name.clone()).collect();
        function.for_each_instruction(|instruction| {
            if let Some(destination) = &instruction.destination {
                assert!(seen.insert(destination.clone()), "{destination} defined twice");
            }
            for argument in &instruction.arguments {
                assert_ne!(argument, "__undefined");
            }
        });
        // Phi labels match predecessors exactly.
        for label in &function.block_labels {
            let block = function.get_block(label);
            for instruction in &block.instructions {
                if instruction.opcode == Opcode::Phi {
                    let mut labels: Vec<&String> = instruction.labels.iter().collect();
                    labels.sort();
                    let mut predecessors: Vec<&String> = block.incoming_blocks.iter().collect();
                    predecessors.sort();
                    assert_eq!(labels, predecessors, "phi shape in {label}");
                }
            }
        }
    }
}

#[test]
fn emitted_assembly_has_no_phis_and_balanced_labels() {
    let text = compile(PRIMES_AND_COLLATZ, true).unwrap();
    assert!(!text.contains("phi"), "phis must not survive to assembly");

    // Every referenced label is defined exactly once.
    let mut defined: Vec<&str> = Vec::new();
    for line in text.lines() {
        let code = line.split(';').next().unwrap().trim();
        if let Some(label) = code.strip_suffix(':') {
            defined.push(label);
        }
    }
    let mut unique = defined.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), defined.len(), "duplicate label definitions:\n{text}");
    for line in text.lines() {
        let code = line.split(';').next().unwrap().trim();
        if code.starts_with("beq") || code.starts_with("bne") {
            let target = code.rsplit(',').next().unwrap().trim();
            if target.parse::<i64>().is_err() {
                assert!(defined.contains(&target), "undefined branch target {target}");
            }
        }
        if let Some(rest) = code.strip_prefix(".word ") {
            let target = rest.trim();
            if target.parse::<i64>().is_err() && !["init", "new", "delete", "print"].contains(&target)
            {
                assert!(defined.contains(&target), "undefined word target {target}");
            }
        }
    }
}
