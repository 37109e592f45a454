//! Post-emission assembly cleanup, run to a fixpoint.
//!
//! Four rewrites: writes to registers that are never read again (globally,
//! and within a straight-line window), unconditional branches to the label
//! that immediately follows, labels nothing references, and register copies
//! whose source can be forwarded through the following straight-line code.

use std::collections::BTreeSet;

use crate::backend::mips::instruction::{MipsInstruction, MipsOpcode, Reg, FRAME, LINK, RESULT, STACK, ZERO};

/// Registers the runtime or calling convention reads behind the compiler's
/// back: argument and result registers, frame, stack, and link.
const PROTECTED: [Reg; 6] = [Reg(1), Reg(2), RESULT, FRAME, STACK, LINK];

pub fn optimize(instructions: &mut Vec<MipsInstruction>) {
    loop {
        let mut changed = false;
        changed |= remove_fallthrough_jumps(instructions);
        changed |= remove_unused_labels(instructions);
        changed |= remove_globally_unused_writes(instructions);
        changed |= remove_locally_unused_writes(instructions);
        changed |= collapse_moves(instructions);
        if !changed {
            break;
        }
    }
}

/// Is this instruction's write removable at all? Only plain data movement
/// qualifies; jumps and stores have effects beyond their register write.
fn removable_write(instruction: &MipsInstruction) -> bool {
    matches!(
        instruction.opcode,
        MipsOpcode::Add
            | MipsOpcode::Sub
            | MipsOpcode::Slt
            | MipsOpcode::Sltu
            | MipsOpcode::Mfhi
            | MipsOpcode::Mflo
            | MipsOpcode::Lis
            | MipsOpcode::Lw
    )
}

/// Remove the instruction at `idx`, and the `.word` that belongs to it when
/// it is a `lis`.
fn remove_write(instructions: &mut Vec<MipsInstruction>, idx: usize) {
    if instructions[idx].opcode == MipsOpcode::Lis {
        assert!(
            idx + 1 < instructions.len() && instructions[idx + 1].opcode == MipsOpcode::Word,
            "lis must be followed by its word"
        );
        instructions.remove(idx + 1);
    }
    instructions.remove(idx);
}

fn remove_globally_unused_writes(instructions: &mut Vec<MipsInstruction>) -> bool {
    let mut result = false;
    loop {
        let mut read_registers: BTreeSet<Reg> = PROTECTED.into_iter().collect();
        for instruction in instructions.iter() {
            read_registers.extend(instruction.read_registers());
        }

        let target = instructions.iter().position(|instruction| {
            removable_write(instruction)
                && instruction
                    .written_register()
                    .is_some_and(|register| !read_registers.contains(&register))
        });
        match target {
            Some(idx) => {
                remove_write(instructions, idx);
                result = true;
            }
            None => return result,
        }
    }
}

fn remove_locally_unused_writes(instructions: &mut Vec<MipsInstruction>) -> bool {
    let mut changed = false;
    let mut idx = 0;
    while idx < instructions.len() {
        let instruction = &instructions[idx];
        let Some(dest) = instruction.written_register() else {
            idx += 1;
            continue;
        };
        if !removable_write(instruction) || [FRAME, STACK, LINK].contains(&dest) {
            idx += 1;
            continue;
        }

        let mut read = false;
        for other in &instructions[idx + 1..] {
            if other.is_jump() || other.opcode == MipsOpcode::Label {
                // Leaving straight-line code: past a return only the result
                // register matters, anything else may be read at the target.
                read = !(other.opcode == MipsOpcode::Jr && dest != RESULT);
                break;
            }
            if other.read_registers().contains(&dest) {
                read = true;
                break;
            }
            if other.written_register() == Some(dest) {
                break;
            }
        }

        if read {
            idx += 1;
        } else {
            remove_write(instructions, idx);
            changed = true;
        }
    }
    changed
}

fn remove_fallthrough_jumps(instructions: &mut Vec<MipsInstruction>) -> bool {
    let mut changed = false;
    let mut idx = 0;
    while idx < instructions.len() {
        let instruction = &instructions[idx];
        let unconditional = instruction.opcode == MipsOpcode::Beq
            && instruction.s == instruction.t
            && instruction.label.is_some();
        if !unconditional {
            idx += 1;
            continue;
        }
        let mut next = idx + 1;
        while next < instructions.len() && instructions[next].opcode == MipsOpcode::Comment {
            next += 1;
        }
        let falls_through = next < instructions.len()
            && instructions[next].opcode == MipsOpcode::Label
            && instructions[next].label == instructions[idx].label;
        if falls_through {
            instructions.remove(idx);
            changed = true;
        } else {
            idx += 1;
        }
    }
    changed
}

fn remove_unused_labels(instructions: &mut Vec<MipsInstruction>) -> bool {
    let mut used: BTreeSet<String> = BTreeSet::new();
    for instruction in instructions.iter() {
        if matches!(instruction.opcode, MipsOpcode::Beq | MipsOpcode::Bne | MipsOpcode::Word) {
            if let Some(label) = &instruction.label {
                used.insert(label.clone());
            }
        }
    }
    let before = instructions.len();
    instructions.retain(|instruction| {
        instruction.opcode != MipsOpcode::Label
            || instruction.label.as_ref().is_some_and(|label| used.contains(label))
    });
    before != instructions.len()
}

fn collapse_moves(instructions: &mut Vec<MipsInstruction>) -> bool {
    let mut changed = false;
    let mut idx = 0;
    while idx < instructions.len() {
        // Normalize sub-with-zero into the canonical copy form.
        if instructions[idx].opcode == MipsOpcode::Sub && instructions[idx].t == ZERO {
            let (d, s) = (instructions[idx].d, instructions[idx].s);
            let comment = std::mem::take(&mut instructions[idx].comment);
            instructions[idx] = MipsInstruction::add(d, s, ZERO);
            instructions[idx].comment = comment;
        }
        if instructions[idx].opcode != MipsOpcode::Add {
            idx += 1;
            continue;
        }
        if instructions[idx].s == ZERO && instructions[idx].t != ZERO {
            let instruction = &mut instructions[idx];
            std::mem::swap(&mut instruction.s, &mut instruction.t);
            changed = true;
        }
        if instructions[idx].t != ZERO {
            idx += 1;
            continue;
        }

        let source = instructions[idx].s;
        let dest = instructions[idx].d;
        if source == dest {
            instructions.remove(idx);
            changed = true;
            continue;
        }

        // Forward the source through the straight-line window.
        for other in instructions[idx + 1..].iter_mut() {
            if other.is_jump() || other.opcode == MipsOpcode::Label {
                break;
            }
            changed |= other.substitute_arguments(dest, source);
            if let Some(written) = other.written_register() {
                if written == source || written == dest {
                    break;
                }
            }
        }
        idx += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globally_unused_write_removed() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), Reg(5)),
            MipsInstruction::add(RESULT, Reg(5), ZERO),
            MipsInstruction::jr(LINK),
        ];
        assert!(remove_globally_unused_writes(&mut instructions));
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].d, RESULT);
    }

    #[test]
    fn test_lis_removed_with_its_word() {
        let mut instructions = vec![
            MipsInstruction::lis(Reg(8)),
            MipsInstruction::word(1000),
            MipsInstruction::jr(LINK),
        ];
        assert!(remove_globally_unused_writes(&mut instructions));
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].opcode, MipsOpcode::Jr);
    }

    #[test]
    fn test_protected_registers_survive() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(1), Reg(5), ZERO),
            MipsInstruction::add(Reg(2), Reg(5), ZERO),
            MipsInstruction::jr(LINK),
        ];
        assert!(!remove_globally_unused_writes(&mut instructions));
        assert_eq!(instructions.len(), 3);
    }

    #[test]
    fn test_locally_overwritten_write_removed() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), ZERO),
            MipsInstruction::add(Reg(8), Reg(9), ZERO),
            MipsInstruction::add(RESULT, Reg(8), ZERO),
            MipsInstruction::jr(LINK),
        ];
        assert!(remove_locally_unused_writes(&mut instructions));
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].s, Reg(9));
    }

    #[test]
    fn test_write_live_across_branch_kept() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), ZERO),
            MipsInstruction::beq(ZERO, ZERO, "elsewhere"),
        ];
        assert!(!remove_locally_unused_writes(&mut instructions));
        assert_eq!(instructions.len(), 2);
    }

    #[test]
    fn test_fallthrough_jump_removed() {
        let mut instructions = vec![
            MipsInstruction::beq(ZERO, ZERO, "next"),
            MipsInstruction::comment("falling"),
            MipsInstruction::label("next"),
            MipsInstruction::jr(LINK),
        ];
        assert!(remove_fallthrough_jumps(&mut instructions));
        assert_eq!(instructions[0].opcode, MipsOpcode::Comment);
    }

    #[test]
    fn test_taken_jump_kept() {
        let mut instructions = vec![
            MipsInstruction::beq(ZERO, ZERO, "far"),
            MipsInstruction::label("near"),
            MipsInstruction::label("far"),
        ];
        assert!(!remove_fallthrough_jumps(&mut instructions));
    }

    #[test]
    fn test_unused_label_removed() {
        let mut instructions = vec![
            MipsInstruction::label("referenced"),
            MipsInstruction::beq(ZERO, ZERO, "referenced"),
            MipsInstruction::label("orphan"),
        ];
        assert!(remove_unused_labels(&mut instructions));
        assert_eq!(instructions.len(), 2);
    }

    #[test]
    fn test_word_reference_keeps_label() {
        let mut instructions = vec![
            MipsInstruction::label("fEntry"),
            MipsInstruction::word_label("fEntry"),
        ];
        assert!(!remove_unused_labels(&mut instructions));
    }

    #[test]
    fn test_move_forwarding() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), ZERO),
            MipsInstruction::add(Reg(9), Reg(8), Reg(8)),
            MipsInstruction::jr(LINK),
        ];
        assert!(collapse_moves(&mut instructions));
        assert_eq!(instructions[1].s, Reg(5));
        assert_eq!(instructions[1].t, Reg(5));
    }

    #[test]
    fn test_forwarding_stops_at_redefinition() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), ZERO),
            MipsInstruction::add(Reg(5), Reg(9), Reg(9)),
            MipsInstruction::add(Reg(10), Reg(8), ZERO),
        ];
        collapse_moves(&mut instructions);
        // $5 was redefined, so the later read of $8 must not be forwarded.
        assert_eq!(instructions[2].s, Reg(8));
    }

    #[test]
    fn test_self_move_removed() {
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(8), ZERO),
            MipsInstruction::jr(LINK),
        ];
        assert!(collapse_moves(&mut instructions));
        assert_eq!(instructions.len(), 1);
    }

    #[test]
    fn test_optimize_runs_to_fixpoint() {
        // The copy feeds a dead chain; everything but the return collapses.
        let mut instructions = vec![
            MipsInstruction::add(Reg(8), Reg(5), ZERO),
            MipsInstruction::add(Reg(9), Reg(8), ZERO),
            MipsInstruction::add(RESULT, Reg(5), ZERO),
            MipsInstruction::jr(LINK),
        ];
        optimize(&mut instructions);
        assert_eq!(instructions.len(), 2);
    }
}
