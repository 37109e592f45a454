//! The compiler binary: reads a source file (or stdin), emits the requested
//! intermediate form or MIPS assembly, or runs the program directly in the
//! IR interpreter.
//!
//! Run with `--help` for the full interface.

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use wlpc::driver;
use wlpc::frontend::ast;
use wlpc::frontend::lexer::Lexer;
use wlpc::frontend::parser::{self, ContextFreeGrammar};
use wlpc::ir::interp;
use wlpc::ir::lowering::Lowerer;
use wlpc::passes;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// The input file; stdin when omitted.
    file: Option<String>,

    /// The output form.
    #[arg(value_enum, short, long, default_value_t = Emit::Asm)]
    emit: Emit,

    /// Skip the optimization pipeline.
    #[arg(long)]
    no_opt: bool,

    /// Run the program in the IR interpreter with these two integer
    /// arguments instead of emitting anything.
    #[arg(long, num_args = 2, value_names = ["A", "B"], allow_negative_numbers = true)]
    run: Option<Vec<i32>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// The token stream.
    Tokens,
    /// The typed abstract syntax tree.
    Ast,
    /// The intermediate representation, by basic block.
    Ir,
    /// MIPS assembly.
    Asm,
}

fn read_input(args: &Args) -> std::io::Result<String> {
    match &args.file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let input = read_input(args).map_err(|error| format!("cannot read input: {error}"))?;
    let optimize = !args.no_opt;

    if let Some(arguments) = &args.run {
        let program =
            driver::compile_to_cfg(&input, optimize).map_err(|error| error.to_string())?;
        let (result, output) = interp::run_with_ints(&program, arguments[0], arguments[1])
            .map_err(|error| error.to_string())?;
        print!("{output}");
        eprintln!("wain returned {}", result.return_value);
        eprintln!("{} dynamic instructions", result.num_dynamic_instructions);
        if result.leaked_blocks > 0 {
            eprintln!("{} heap block(s) never freed", result.leaked_blocks);
        }
        return Ok(());
    }

    match args.emit {
        Emit::Tokens => {
            let tokens =
                Lexer::new(&input).token_stream().map_err(|error| error.to_string())?;
            for token in tokens {
                println!("{token}");
            }
        }
        Emit::Ast => {
            let grammar = ContextFreeGrammar::default_grammar();
            let tree = parser::parse(&grammar, &input).map_err(|error| error.to_string())?;
            let program = ast::build_ast(&tree).map_err(|error| error.to_string())?;
            println!("{program:#?}");
        }
        Emit::Ir => {
            let grammar = ContextFreeGrammar::default_grammar();
            let tree = parser::parse(&grammar, &input).map_err(|error| error.to_string())?;
            let mut program = ast::build_ast(&tree).map_err(|error| error.to_string())?;
            ast::fold::fold_constants(&mut program);
            let mut program = Lowerer::new().lower(&program);
            if optimize {
                passes::optimize(&mut program);
            }
            print!("{program}");
        }
        Emit::Asm => {
            let assembly =
                driver::compile(&input, optimize).map_err(|error| error.to_string())?;
            print!("{assembly}");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
