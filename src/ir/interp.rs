//! A direct interpreter for the IR.
//!
//! Executes the CFG form of a program, before or after optimization, in or
//! out of SSA (phis are resolved from the dynamically recorded predecessor
//! block). The test suite uses it to check end-to-end behavior without a MIPS
//! machine, and the CLI exposes it for debugging.
//!
//! The heap is a list of blocks with an active flag; `free` deactivates and a
//! block that is still active when `wain` returns is reported as a leak.
//! Freeing the NULL sentinel is a no-op, mirroring the guard the code
//! generator emits around the runtime's `delete`.

use std::io::Write;

use thiserror::Error;

use crate::common::fx_hash::FxHashMap;
use crate::ir::cfg::{ControlFlowGraph, Program};
use crate::ir::ir::{Opcode, Type};

#[derive(Debug, Error)]
#[error("runtime error: {0}")]
pub struct RuntimeError(pub String);

type ExecResult<T> = Result<T, RuntimeError>;

fn error<T>(message: impl Into<String>) -> ExecResult<T> {
    Err(RuntimeError(message.into()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i32),
    Bool(bool),
    /// A pointer-typed constant; NULL is `RawPointer(1)`.
    RawPointer(i32),
    /// The address of a stack variable, as produced by `addressof`.
    Address { frame: usize, variable: String },
    /// A pointer into heap block `block` at word `offset`.
    HeapPointer { block: usize, offset: i64 },
}

#[derive(Debug)]
struct HeapBlock {
    values: Vec<i32>,
    active: bool,
}

#[derive(Debug, Default)]
pub struct RunResult {
    pub return_value: i32,
    pub num_dynamic_instructions: usize,
    pub leaked_blocks: usize,
}

pub struct Interpreter<'p, 'w> {
    program: &'p Program,
    output: &'w mut dyn Write,
    heap: Vec<HeapBlock>,
    frames: Vec<FxHashMap<String, Value>>,
    num_dynamic_instructions: usize,
}

impl<'p, 'w> Interpreter<'p, 'w> {
    pub fn new(program: &'p Program, output: &'w mut dyn Write) -> Self {
        Self { program, output, heap: Vec::new(), frames: Vec::new(), num_dynamic_instructions: 0 }
    }

    /// Allocate a heap array for an array-parameter `wain`; returns the
    /// pointer value to pass as its first argument.
    pub fn alloc_array(&mut self, values: &[i32]) -> Value {
        let block = self.heap.len();
        self.heap.push(HeapBlock { values: values.to_vec(), active: true });
        Value::HeapPointer { block, offset: 0 }
    }

    pub fn run_wain(&mut self, arguments: Vec<Value>) -> ExecResult<RunResult> {
        let program = self.program;
        let wain = program.wain();
        assert_eq!(arguments.len(), 2, "wain takes exactly two arguments");
        let result = self.interpret(wain, arguments)?;
        let Value::Int(return_value) = result else {
            return error(format!("wain returned a non-integer value {result:?}"));
        };

        // The input array (heap block 0, when present) belongs to the caller.
        let leaked_blocks = self
            .heap
            .iter()
            .enumerate()
            .filter(|(idx, block)| block.active && !(*idx == 0 && self.wain_takes_array()))
            .count();
        Ok(RunResult {
            return_value,
            num_dynamic_instructions: self.num_dynamic_instructions,
            leaked_blocks,
        })
    }

    fn wain_takes_array(&self) -> bool {
        self.program.wain().parameters[0].ty == Type::IntStar
    }

    fn get(&self, name: &str) -> ExecResult<Value> {
        match self.frames.last().and_then(|frame| frame.get(name)) {
            Some(value) => Ok(value.clone()),
            None => error(format!("variable {name} read before assignment")),
        }
    }

    fn get_int(&self, name: &str) -> ExecResult<i32> {
        match self.get(name)? {
            Value::Int(value) => Ok(value),
            other => error(format!("variable {name} is {other:?}, expected an int")),
        }
    }

    fn get_bool(&self, name: &str) -> ExecResult<bool> {
        match self.get(name)? {
            Value::Bool(value) => Ok(value),
            other => error(format!("variable {name} is {other:?}, expected a bool")),
        }
    }

    fn set(&mut self, destination: &Option<String>, value: Value) {
        let name = destination.as_ref().expect("instruction writes a destination");
        self.frames.last_mut().unwrap().insert(name.clone(), value);
    }

    fn compare(&self, lhs: &Value, rhs: &Value) -> ExecResult<Option<std::cmp::Ordering>> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
            (Value::RawPointer(a), Value::RawPointer(b)) => Ok(Some(a.cmp(b))),
            (
                Value::HeapPointer { block: a, offset: i },
                Value::HeapPointer { block: b, offset: j },
            ) if a == b => Ok(Some(i.cmp(j))),
            // Distinct provenances are never equal and have no ordering.
            (Value::HeapPointer { .. }, Value::RawPointer(_))
            | (Value::RawPointer(_), Value::HeapPointer { .. })
            | (Value::HeapPointer { .. }, Value::HeapPointer { .. }) => Ok(None),
            (lhs, rhs) => error(format!("cannot compare {lhs:?} with {rhs:?}")),
        }
    }

    fn load(&self, pointer: &Value) -> ExecResult<Value> {
        match pointer {
            Value::HeapPointer { block, offset } => {
                let heap_block = &self.heap[*block];
                if !heap_block.active {
                    return error("load through a pointer into freed memory");
                }
                if *offset < 0 || *offset as usize >= heap_block.values.len() {
                    return error(format!("load out of bounds at offset {offset}"));
                }
                Ok(Value::Int(heap_block.values[*offset as usize]))
            }
            Value::Address { frame, variable } => {
                match self.frames[*frame].get(variable) {
                    Some(value) => Ok(value.clone()),
                    None => error(format!("load from dead stack variable {variable}")),
                }
            }
            Value::RawPointer(value) => {
                error(format!("load through raw pointer {value} (NULL dereference traps)"))
            }
            other => error(format!("load through non-pointer {other:?}")),
        }
    }

    fn store_value(&mut self, pointer: &Value, value: Value) -> ExecResult<()> {
        match pointer {
            Value::HeapPointer { block, offset } => {
                let heap_block = &mut self.heap[*block];
                if !heap_block.active {
                    return error("store through a pointer into freed memory");
                }
                if *offset < 0 || *offset as usize >= heap_block.values.len() {
                    return error(format!("store out of bounds at offset {offset}"));
                }
                let Value::Int(value) = value else {
                    return error(format!("cannot store non-integer {value:?} to the heap"));
                };
                heap_block.values[*offset as usize] = value;
                Ok(())
            }
            Value::Address { frame, variable } => {
                self.frames[*frame].insert(variable.clone(), value);
                Ok(())
            }
            Value::RawPointer(pointer) => {
                error(format!("store through raw pointer {pointer} (NULL dereference traps)"))
            }
            other => error(format!("store through non-pointer {other:?}")),
        }
    }

    fn pointer_offset(&self, pointer: &Value, words: i64) -> ExecResult<Value> {
        match pointer {
            Value::HeapPointer { block, offset } => {
                Ok(Value::HeapPointer { block: *block, offset: offset + words })
            }
            Value::RawPointer(value) => {
                Ok(Value::RawPointer(value.wrapping_add((words as i32).wrapping_mul(4))))
            }
            other => error(format!("pointer arithmetic on {other:?}")),
        }
    }

    fn interpret(
        &mut self,
        function: &ControlFlowGraph,
        arguments: Vec<Value>,
    ) -> ExecResult<Value> {
        assert_eq!(
            arguments.len(),
            function.parameters.len(),
            "wrong number of arguments to {}",
            function.name
        );
        let mut frame = FxHashMap::default();
        for (parameter, argument) in function.parameters.iter().zip(arguments) {
            frame.insert(parameter.name.clone(), argument);
        }
        self.frames.push(frame);

        let mut current_block = function.entry_label.clone();
        let mut last_block = String::new();
        let mut instruction_idx = 0usize;
        loop {
            let block = function.get_block(&current_block);
            let instruction = &block.instructions[instruction_idx];
            instruction_idx += 1;
            if instruction.opcode != Opcode::Label {
                self.num_dynamic_instructions += 1;
            }

            match instruction.opcode {
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let lhs = self.get_int(&instruction.arguments[0])?;
                    let rhs = self.get_int(&instruction.arguments[1])?;
                    let value = match instruction.opcode {
                        Opcode::Add => lhs.wrapping_add(rhs),
                        Opcode::Sub => lhs.wrapping_sub(rhs),
                        Opcode::Mul => lhs.wrapping_mul(rhs),
                        Opcode::Div if rhs == 0 => return error("division by zero"),
                        Opcode::Div => lhs.wrapping_div(rhs),
                        Opcode::Mod if rhs == 0 => return error("modulo by zero"),
                        _ => lhs.wrapping_rem(rhs),
                    };
                    self.set(&instruction.destination, Value::Int(value));
                }

                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge | Opcode::Eq | Opcode::Ne => {
                    let lhs = self.get(&instruction.arguments[0])?;
                    let rhs = self.get(&instruction.arguments[1])?;
                    let ordering = self.compare(&lhs, &rhs)?;
                    let value = match (instruction.opcode, ordering) {
                        (Opcode::Eq, None) => false,
                        (Opcode::Ne, None) => true,
                        (_, None) => {
                            return error(format!("cannot order {lhs:?} against {rhs:?}"))
                        }
                        (Opcode::Lt, Some(ord)) => ord.is_lt(),
                        (Opcode::Le, Some(ord)) => ord.is_le(),
                        (Opcode::Gt, Some(ord)) => ord.is_gt(),
                        (Opcode::Ge, Some(ord)) => ord.is_ge(),
                        (Opcode::Eq, Some(ord)) => ord.is_eq(),
                        (_, Some(ord)) => ord.is_ne(),
                    };
                    self.set(&instruction.destination, Value::Bool(value));
                }

                Opcode::Jmp => {
                    last_block = std::mem::replace(&mut current_block, instruction.labels[0].clone());
                    instruction_idx = 0;
                }
                Opcode::Br => {
                    let condition = self.get_bool(&instruction.arguments[0])?;
                    let target = instruction.labels[if condition { 0 } else { 1 }].clone();
                    last_block = std::mem::replace(&mut current_block, target);
                    instruction_idx = 0;
                }
                Opcode::Ret => {
                    let result = match instruction.arguments.first() {
                        Some(name) => self.get(name)?,
                        None => Value::Void,
                    };
                    self.frames.pop();
                    return Ok(result);
                }
                Opcode::Call => {
                    let program = self.program;
                    let callee = program.get_function(&instruction.funcs[0]);
                    let arguments = instruction
                        .arguments
                        .iter()
                        .map(|argument| self.get(argument))
                        .collect::<ExecResult<Vec<Value>>>()?;
                    let result = self.interpret(callee, arguments)?;
                    self.set(&instruction.destination, result);
                }

                Opcode::Const => {
                    let value = match instruction.ty {
                        Type::Int => Value::Int(instruction.value as i32),
                        Type::IntStar => Value::RawPointer(instruction.value as i32),
                        Type::Bool => Value::Bool(instruction.value != 0),
                        Type::Void => return error("const of void type"),
                    };
                    self.set(&instruction.destination, value);
                }
                Opcode::Id => {
                    let value = self.get(&instruction.arguments[0])?;
                    self.set(&instruction.destination, value);
                }
                Opcode::Print => {
                    let value = self.get_int(&instruction.arguments[0])?;
                    writeln!(self.output, "{value}")
                        .map_err(|e| RuntimeError(format!("write failed: {e}")))?;
                }
                Opcode::Nop | Opcode::Label => {}

                Opcode::Alloc => {
                    let size = self.get_int(&instruction.arguments[0])?;
                    let value = if size <= 0 {
                        // The runtime allocator fails; the caller receives NULL.
                        Value::RawPointer(1)
                    } else {
                        let block = self.heap.len();
                        self.heap.push(HeapBlock { values: vec![0; size as usize], active: true });
                        Value::HeapPointer { block, offset: 0 }
                    };
                    self.set(&instruction.destination, value);
                }
                Opcode::Free => {
                    let pointer = self.get(&instruction.arguments[0])?;
                    match pointer {
                        // Deleting NULL is skipped, as the emitted guard does.
                        Value::RawPointer(1) => {}
                        Value::HeapPointer { block, offset: 0 } => {
                            if !self.heap[block].active {
                                return error("double free of a heap block");
                            }
                            self.heap[block].active = false;
                        }
                        other => return error(format!("free of invalid pointer {other:?}")),
                    }
                }
                Opcode::Store => {
                    let pointer = self.get(&instruction.arguments[0])?;
                    let value = self.get(&instruction.arguments[1])?;
                    self.store_value(&pointer, value)?;
                }
                Opcode::Load => {
                    let pointer = self.get(&instruction.arguments[0])?;
                    let value = self.load(&pointer)?;
                    self.set(&instruction.destination, value);
                }
                Opcode::PtrAdd => {
                    let pointer = self.get(&instruction.arguments[0])?;
                    let offset = self.get_int(&instruction.arguments[1])?;
                    let value = self.pointer_offset(&pointer, offset as i64)?;
                    self.set(&instruction.destination, value);
                }
                Opcode::PtrSub => {
                    let pointer = self.get(&instruction.arguments[0])?;
                    let offset = self.get_int(&instruction.arguments[1])?;
                    let value = self.pointer_offset(&pointer, -(offset as i64))?;
                    self.set(&instruction.destination, value);
                }
                Opcode::PtrDiff => {
                    let lhs = self.get(&instruction.arguments[0])?;
                    let rhs = self.get(&instruction.arguments[1])?;
                    let value = match (&lhs, &rhs) {
                        (
                            Value::HeapPointer { block: a, offset: i },
                            Value::HeapPointer { block: b, offset: j },
                        ) if a == b => (i - j) as i32,
                        (Value::RawPointer(a), Value::RawPointer(b)) => a.wrapping_sub(*b) / 4,
                        _ => return error(format!("pointer difference of {lhs:?} and {rhs:?}")),
                    };
                    self.set(&instruction.destination, Value::Int(value));
                }
                Opcode::AddressOf => {
                    let value = Value::Address {
                        frame: self.frames.len() - 1,
                        variable: instruction.arguments[0].clone(),
                    };
                    self.set(&instruction.destination, value);
                }

                Opcode::Phi => {
                    assert!(!last_block.is_empty(), "phi reached before any jump");
                    let idx = instruction
                        .labels
                        .iter()
                        .position(|label| *label == last_block)
                        .unwrap_or_else(|| panic!("phi has no slot for predecessor {last_block}"));
                    let value = self.get(&instruction.arguments[idx])?;
                    self.set(&instruction.destination, value);
                }
            }
        }
    }
}

/// Run a program's `wain` with integer arguments, collecting printed output.
pub fn run_with_ints(program: &Program, a: i32, b: i32) -> ExecResult<(RunResult, String)> {
    let mut output = Vec::new();
    let mut interpreter = Interpreter::new(program, &mut output);
    let result = interpreter.run_wain(vec![Value::Int(a), Value::Int(b)])?;
    Ok((result, String::from_utf8(output).expect("interpreter output is ascii")))
}

/// Run a program's `wain` with an array first argument.
pub fn run_with_array(program: &Program, values: &[i32]) -> ExecResult<(RunResult, String)> {
    let mut output = Vec::new();
    let mut interpreter = Interpreter::new(program, &mut output);
    let array = interpreter.alloc_array(values);
    let result = interpreter.run_wain(vec![array, Value::Int(values.len() as i32)])?;
    Ok((result, String::from_utf8(output).expect("interpreter output is ascii")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::build_ast;
    use crate::frontend::parser::{parse, ContextFreeGrammar};
    use crate::ir::lowering::Lowerer;

    fn lower(source: &str) -> Program {
        let grammar = ContextFreeGrammar::default_grammar();
        let program = build_ast(&parse(&grammar, source).unwrap()).unwrap();
        Lowerer::new().lower(&program)
    }

    #[test]
    fn test_integer_sum() {
        let program = lower("int wain(int a, int b) { return a + b; }");
        let (result, output) = run_with_ints(&program, 3, 4).unwrap();
        assert_eq!(result.return_value, 7);
        assert_eq!(output, "");
    }

    #[test]
    fn test_loop_and_print() {
        let program = lower(
            "int wain(int a, int b) {
                int i = 0;
                while (i < a) { println(i); i = i + 1; }
                return i;
            }",
        );
        let (result, output) = run_with_ints(&program, 3, 0).unwrap();
        assert_eq!(result.return_value, 3);
        assert_eq!(output, "0\n1\n2\n");
    }

    #[test]
    fn test_heap_roundtrip_and_leak_detection() {
        let program = lower(
            "int wain(int a, int b) {
                int* p = NULL;
                p = new int[3];
                *p = 42;
                *(p + 1) = a;
                println(*p + *(p + 1));
                delete [] p;
                return 0;
            }",
        );
        let (result, output) = run_with_ints(&program, 8, 0).unwrap();
        assert_eq!(output, "50\n");
        assert_eq!(result.leaked_blocks, 0);

        let leaky = lower("int wain(int a, int b) { int* p = NULL; p = new int[3]; return a; }");
        let (result, _) = run_with_ints(&leaky, 1, 1).unwrap();
        assert_eq!(result.leaked_blocks, 1);
    }

    #[test]
    fn test_null_delete_skipped() {
        let program = lower("int wain(int a, int b) { int* p = NULL; delete [] p; return 0; }");
        let (result, _) = run_with_ints(&program, 1, 1).unwrap();
        assert_eq!(result.return_value, 0);
    }

    #[test]
    fn test_null_dereference_traps() {
        let program = lower("int wain(int a, int b) { int* p = NULL; return *p; }");
        assert!(run_with_ints(&program, 1, 1).is_err());
    }

    #[test]
    fn test_division_by_zero_is_a_runtime_error() {
        let program = lower("int wain(int a, int b) { return a / b; }");
        assert!(run_with_ints(&program, 1, 0).is_err());
        assert_eq!(run_with_ints(&program, 7, 2).unwrap().0.return_value, 3);
    }

    #[test]
    fn test_array_argument() {
        let program = lower(
            "int wain(int* a, int n) {
                int i = 0;
                int total = 0;
                while (i < n) { total = total + *(a + i); i = i + 1; }
                return total;
            }",
        );
        let (result, _) = run_with_array(&program, &[5, 10, 15]).unwrap();
        assert_eq!(result.return_value, 30);
    }

    #[test]
    fn test_address_of_roundtrip() {
        let program = lower(
            "int update(int* cell) { *cell = *cell + 1; return 0; }
             int wain(int a, int b) { int x = 10; int y = 0; y = update(&x); return x; }",
        );
        let (result, _) = run_with_ints(&program, 0, 0).unwrap();
        assert_eq!(result.return_value, 11);
    }

    #[test]
    fn test_recursion() {
        let program = lower(
            "int fact(int n) { int r = 1; if (n > 1) { r = n * fact(n - 1); } return r; }
             int wain(int a, int b) { return fact(a); }",
        );
        let (result, _) = run_with_ints(&program, 5, 0).unwrap();
        assert_eq!(result.return_value, 120);
    }

    #[test]
    fn test_pointer_comparisons() {
        let program = lower(
            "int wain(int* a, int n) {
                int* p = NULL;
                int result = 0;
                if (a == p) { result = 1; } else { result = 2; }
                return result;
            }",
        );
        let (result, _) = run_with_array(&program, &[1, 2]).unwrap();
        assert_eq!(result.return_value, 2);
    }
}
