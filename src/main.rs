use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use loxvm::vm::{InterpretError, Vm};

fn main() -> ExitCode {
    let mut args = std::env::args();
    let _program = args.next();
    match args.next() {
        None => run_repl(),
        Some(path) => run_file(&path),
    }
}

fn run_repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {
                if let Err(err) = vm.interpret(&line) {
                    report(err);
                }
            }
            Err(_) => return ExitCode::from(74),
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", path, err);
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match &err {
                InterpretError::Compile(_) => 65,
                InterpretError::Runtime(_) => 70,
            };
            report(err);
            ExitCode::from(code)
        }
    }
}

fn report(err: InterpretError) {
    match err {
        InterpretError::Compile(errors) => {
            for error in errors {
                eprintln!("{}", error);
            }
        }
        InterpretError::Runtime(error) => {
            eprint!("{}", error);
        }
    }
}
