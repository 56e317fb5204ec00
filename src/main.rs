//! The `interp` binary: an interactive prompt, a file runner and a couple of
//! inspection modes for the tokenizer and the hash layer.

use std::process;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use tclet::interp::Interp;
use tclet::parser::Parser;
use tclet::value::Value;
use tclet::{CmdResult, Flow};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = match args.len() {
        1 => repl(),
        2 if args[1] == "--test-ht" => test_hash_layer(),
        3 if args[1] == "--parse" => dump_tokens(&args[2], DumpMode::Script),
        3 if args[1] == "--parse-expr" => dump_tokens(&args[2], DumpMode::Expr),
        3 if args[1] == "--parse-subst" => dump_tokens(&args[2], DumpMode::Subst),
        _ if args.len() >= 2 && !args[1].starts_with("--") => run_file(&args[1], &args[2..]),
        _ => {
            eprintln!(
                "usage: interp ?FILE? ?--parse FILE? ?--parse-expr FILE? ?--parse-subst FILE? ?--test-ht?"
            );
            1
        }
    };
    process::exit(code);
}

/// Print the runtime-error report: message, location, then one line per
/// stack-trace frame.
fn print_error(interp: &mut Interp) {
    let (file, line) = {
        let (f, l) = interp.error_location();
        (f.to_string(), l)
    };
    println!("Runtime error, file \"{file}\", line {line}:");
    println!("    {}", interp.result().as_str());
    let trace = interp.stack_trace().clone();
    let items: Vec<Value> = trace.list_elements(interp.heap());
    for frame in items.chunks_exact(3) {
        println!(
            "In procedure '{}' called at file \"{}\", line {}",
            frame[0].as_str(),
            frame[1].as_str(),
            frame[2].as_str()
        );
    }
}

fn exit_code(r: CmdResult) -> i32 {
    match r {
        Ok(()) => 0,
        Err(f) => f.retcode().as_wide() as i32,
    }
}

fn run_file(path: &str, script_args: &[String]) -> i32 {
    let mut interp = Interp::new();
    let argv0 = interp.heap().str(path);
    let _ = interp.set_var("argv0", argv0);
    let argv: Vec<Value> = script_args
        .iter()
        .map(|a| interp.heap().str(a.as_str()))
        .collect();
    let argc = interp.heap().int(argv.len() as i64);
    let argv = interp.heap().list(argv);
    let _ = interp.set_var("argv", argv);
    let _ = interp.set_var("argc", argc);
    let r = interp.eval_file(path);
    if r == Err(Flow::Err) {
        print_error(&mut interp);
    }
    exit_code(r)
}

fn repl() -> i32 {
    println!(
        "Welcome to tclet {}. Type commands, Ctrl-D leaves.",
        env!("CARGO_PKG_VERSION")
    );
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("cannot initialize line editing: {e}");
            return 1;
        }
    };
    let mut interp = Interp::new();
    let mut code = 0i64;
    loop {
        match rl.readline(&format!("{code} tclet> ")) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                let r = interp.eval(&line);
                code = match &r {
                    Ok(()) => 0,
                    Err(f) => f.retcode().as_wide(),
                };
                if r == Err(Flow::Err) {
                    print_error(&mut interp);
                } else {
                    let result = interp.result().as_str();
                    if !result.is_empty() {
                        println!("{result}");
                    }
                }
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("input error: {e}");
                return 1;
            }
        }
    }
    0
}

enum DumpMode {
    Script,
    Expr,
    Subst,
}

/// Tokenize a file with the chosen dialect and print one line per token:
/// line number, kind, decoded text and its length.
fn dump_tokens(path: &str, mode: DumpMode) -> i32 {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cannot read {path}: {e}");
            return 1;
        }
    };
    let mut parser = Parser::new(&text, 1);
    while !parser.eof() {
        match mode {
            DumpMode::Script => parser.parse_script_token(),
            DumpMode::Subst => parser.parse_subst_token(0),
            DumpMode::Expr => {
                if parser.parse_expr_token().is_err() {
                    println!("PARSE ERROR");
                    return 1;
                }
            }
        }
        let (tok, kind, line) = parser.token();
        println!("{} {}: '{}' ({})", line, kind.name(), tok, tok.len());
    }
    0
}

/// Smoke test of the hash layer: a dictionary variable filled and probed
/// through the same paths scripts use.
fn test_hash_layer() -> i32 {
    let mut interp = Interp::new();
    let script = "set d {}\n\
                  for {set i 0} {$i < 10000} {incr i} { dict set d key$i $i }\n\
                  set hits 0\n\
                  for {set i 0} {$i < 10000} {incr i 100} {\n\
                      if {[dict get $d key$i] == $i} { incr hits }\n\
                  }\n\
                  set hits";
    match interp.eval(script) {
        Ok(()) => {
            println!("Used: 10000");
            println!("Probe hits: {}", interp.result().as_str());
            println!("hash layer ok");
            0
        }
        Err(_) => {
            println!("hash layer FAILED: {}", interp.result().as_str());
            1
        }
    }
}
