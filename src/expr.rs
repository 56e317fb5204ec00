//! Expressions. `expr` text is compiled once into a postfix program for a
//! small stack machine and the program is cached as the internal
//! representation of the expression value.
//!
//! Compilation is shunting-yard over a fixed operator table (operators
//! cannot be redefined, which is what makes the dedicated machine
//! worthwhile). A compile-time check verifies the stack effect of the
//! program: every binary operator finds two operands, every unary one, and
//! exactly one value remains at the end.
//!
//! Evaluation tries integers first: when both operands convert to a 64-bit
//! integer - and neither is a double without a string form - the operator
//! runs on integers; otherwise it falls through to doubles. The integer-only
//! operators (`%`, shifts, rotations and the bitwise group) reject doubles
//! outright. `eq` and `ne` always compare bytes. `&&` and `||` evaluate both
//! sides; there is no short circuit.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::interp::Interp;
use crate::script;
use crate::value::{Heap, Rep, Value};
use crate::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpCode {
    Not,
    BitNot,
    UnaryMinus,
    UnaryPlus,
    Mul,
    Div,
    Mod,
    Sub,
    Add,
    RotL,
    RotR,
    LShift,
    RShift,
    Lt,
    Gt,
    Le,
    Ge,
    NumEq,
    NumNe,
    StrEq,
    StrNe,
    BitAnd,
    BitXor,
    BitOr,
    LogicAnd,
    LogicOr,
    Ternary,
    // Operands.
    Number,
    Command,
    Variable,
    DictSugar,
    StringLit,
}

pub(crate) struct OpInfo {
    pub name: &'static str,
    pub precedence: i32,
    pub arity: i32,
    pub code: OpCode,
}

const OPERATORS: &[OpInfo] = &[
    OpInfo { name: "!", precedence: 300, arity: 1, code: OpCode::Not },
    OpInfo { name: "~", precedence: 300, arity: 1, code: OpCode::BitNot },
    OpInfo { name: "unarymin", precedence: 300, arity: 1, code: OpCode::UnaryMinus },
    OpInfo { name: "unaryplus", precedence: 300, arity: 1, code: OpCode::UnaryPlus },
    OpInfo { name: "*", precedence: 200, arity: 2, code: OpCode::Mul },
    OpInfo { name: "/", precedence: 200, arity: 2, code: OpCode::Div },
    OpInfo { name: "%", precedence: 200, arity: 2, code: OpCode::Mod },
    OpInfo { name: "-", precedence: 100, arity: 2, code: OpCode::Sub },
    OpInfo { name: "+", precedence: 100, arity: 2, code: OpCode::Add },
    OpInfo { name: "<<<", precedence: 90, arity: 3, code: OpCode::RotL },
    OpInfo { name: ">>>", precedence: 90, arity: 3, code: OpCode::RotR },
    OpInfo { name: "<<", precedence: 90, arity: 2, code: OpCode::LShift },
    OpInfo { name: ">>", precedence: 90, arity: 2, code: OpCode::RShift },
    OpInfo { name: "<", precedence: 80, arity: 2, code: OpCode::Lt },
    OpInfo { name: ">", precedence: 80, arity: 2, code: OpCode::Gt },
    OpInfo { name: "<=", precedence: 80, arity: 2, code: OpCode::Le },
    OpInfo { name: ">=", precedence: 80, arity: 2, code: OpCode::Ge },
    OpInfo { name: "==", precedence: 70, arity: 2, code: OpCode::NumEq },
    OpInfo { name: "!=", precedence: 70, arity: 2, code: OpCode::NumNe },
    OpInfo { name: "eq", precedence: 60, arity: 2, code: OpCode::StrEq },
    OpInfo { name: "ne", precedence: 60, arity: 2, code: OpCode::StrNe },
    OpInfo { name: "&", precedence: 50, arity: 2, code: OpCode::BitAnd },
    OpInfo { name: "^", precedence: 49, arity: 2, code: OpCode::BitXor },
    OpInfo { name: "|", precedence: 48, arity: 2, code: OpCode::BitOr },
    OpInfo { name: "&&", precedence: 10, arity: 2, code: OpCode::LogicAnd },
    OpInfo { name: "||", precedence: 10, arity: 2, code: OpCode::LogicOr },
    // Reserved; programs using it fail the correctness check.
    OpInfo { name: "?", precedence: 5, arity: 3, code: OpCode::Ternary },
];

pub(crate) fn operators() -> &'static [OpInfo] {
    OPERATORS
}

fn operator_info(name: &str) -> Option<&'static OpInfo> {
    OPERATORS.iter().find(|op| op.name == name)
}

/// A compiled expression: a postfix opcode stream with one operand value per
/// instruction (the literal, variable name, nested script, or the operator's
/// own text).
pub struct ExprRep {
    pub(crate) prog: Vec<(OpCode, Value)>,
}

/// Verify the stack effect of a program: no underflow anywhere and exactly
/// one value left at the end.
fn check_correctness(prog: &[(OpCode, Value)]) -> Result<(), String> {
    let invalid = || "Invalid expression".to_string();
    let mut stacklen = 0i32;
    for (code, _) in prog {
        match code {
            OpCode::Number
            | OpCode::StringLit
            | OpCode::Variable
            | OpCode::DictSugar
            | OpCode::Command => stacklen += 1,
            OpCode::Not | OpCode::BitNot | OpCode::UnaryMinus | OpCode::UnaryPlus => {
                if stacklen < 1 {
                    return Err(invalid());
                }
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Lt
            | OpCode::Gt
            | OpCode::Le
            | OpCode::Ge
            | OpCode::RotL
            | OpCode::RotR
            | OpCode::LShift
            | OpCode::RShift
            | OpCode::NumEq
            | OpCode::NumNe
            | OpCode::StrEq
            | OpCode::StrNe
            | OpCode::BitAnd
            | OpCode::BitXor
            | OpCode::BitOr
            | OpCode::LogicAnd
            | OpCode::LogicOr => {
                if stacklen < 2 {
                    return Err(invalid());
                }
                stacklen -= 1;
            }
            _ => return Err(invalid()),
        }
    }
    if stacklen != 1 {
        return Err(invalid());
    }
    Ok(())
}

/// Compile expression text to a postfix program.
pub(crate) fn compile_expr(heap: &mut Heap, text: &str) -> Result<ExprRep, String> {
    use crate::parser::{Parser, TokenKind};

    let syntax = || "Syntax error in expression".to_string();
    let mut prog: Vec<(OpCode, Value)> = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut parser = Parser::new(text, 1);
    while !parser.eof() {
        if parser.parse_expr_token().is_err() {
            return Err(syntax());
        }
        let (tok, kind, _) = parser.token();
        match kind {
            TokenKind::Eol => break,
            TokenKind::Str | TokenKind::Esc => prog.push((OpCode::StringLit, heap.str(tok))),
            TokenKind::Var => prog.push((OpCode::Variable, heap.str(tok))),
            TokenKind::DictSugar => prog.push((OpCode::DictSugar, heap.str(tok))),
            TokenKind::Cmd => prog.push((OpCode::Command, heap.str(tok))),
            TokenKind::ExprNumber => prog.push((OpCode::Number, heap.str(tok))),
            TokenKind::ExprOperator => {
                let op = operator_info(&tok).ok_or_else(syntax)?;
                while op.arity != 1 {
                    let emit = match stack.last().map(|s| operator_info(s)) {
                        Some(Some(top)) if top.precedence >= op.precedence => top.code,
                        _ => break,
                    };
                    let name = stack.pop().unwrap_or_default();
                    prog.push((emit, heap.str(name)));
                }
                stack.push(tok);
            }
            TokenKind::SubexprStart => stack.push("(".to_string()),
            TokenKind::SubexprEnd => {
                let mut found = false;
                while let Some(name) = stack.pop() {
                    if name == "(" {
                        found = true;
                        break;
                    }
                    if let Some(op) = operator_info(&name) {
                        prog.push((op.code, heap.str(name)));
                    }
                }
                if !found {
                    return Err("Unexpected close parenthesis".to_string());
                }
            }
            _ => return Err(syntax()),
        }
    }
    while let Some(name) = stack.pop() {
        if name == "(" {
            return Err("Missing close parenthesis".to_string());
        }
        let op = operator_info(&name).ok_or_else(syntax)?;
        prog.push((op.code, heap.str(name)));
    }
    check_correctness(&prog)?;
    Ok(ExprRep { prog })
}

/// Compiled program of `v`, building and caching it on first use. Literals
/// of expressions written inside a procedure body are unified with the body
/// script's tokens.
pub(crate) fn expr_of(interp: &mut Interp, v: &Value) -> Result<Rc<ExprRep>, Flow> {
    if let Some(rep) = v.expr_rep() {
        return Ok(rep);
    }
    let from_source = v.source_info().is_some();
    let text = v.as_str();
    let mut rep = match compile_expr(interp.heap(), &text) {
        Ok(rep) => rep,
        Err(msg) => return Err(interp.error(msg)),
    };
    if from_source
        && let Some(body) = interp.current_proc_body()
        && let Some(body_script) = body.script_rep()
    {
        for (_, operand) in rep.prog.iter_mut() {
            if let Some(shared) = script::search_literal(&body_script, operand) {
                *operand = shared;
            }
        }
    }
    let rep = Rc::new(rep);
    v.set_rep(Rep::Expr(Rc::clone(&rep)));
    Ok(rep)
}

fn integer_only_on_doubles(code: OpCode) -> bool {
    matches!(
        code,
        OpCode::RotL
            | OpCode::RotR
            | OpCode::LShift
            | OpCode::RShift
            | OpCode::BitAnd
            | OpCode::BitXor
            | OpCode::BitOr
            | OpCode::Mod
    )
}

/// Run the expression machine over `expr_obj` and produce the result value.
pub(crate) fn eval_expr(interp: &mut Interp, expr_obj: &Value) -> Result<Value, Flow> {
    // Hold our own handle on the program: the expression value may shimmer
    // while nested commands run.
    let expr = expr_of(interp, expr_obj)?;
    let mut stack: SmallVec<[Value; 10]> = SmallVec::new();
    for (code, operand) in &expr.prog {
        match code {
            OpCode::Number | OpCode::StringLit => stack.push(operand.clone()),
            OpCode::Variable => {
                let v = match interp.get_variable(operand, true) {
                    Some(v) => v,
                    None => return Err(Flow::Err),
                };
                stack.push(v);
            }
            OpCode::DictSugar => {
                let v = interp.expand_dict_sugar(operand)?;
                stack.push(v);
            }
            OpCode::Command => {
                interp.eval_value(operand)?;
                stack.push(interp.result().clone());
            }
            OpCode::StrEq | OpCode::StrNe => {
                let b = stack.pop().ok_or(Flow::Err)?;
                let a = stack.pop().ok_or(Flow::Err)?;
                let equal = a.as_str() == b.as_str();
                let wc = match code {
                    OpCode::StrEq => equal as i64,
                    _ => !equal as i64,
                };
                stack.push(interp.heap().int(wc));
            }
            OpCode::Not | OpCode::BitNot => {
                let a = stack.pop().ok_or(Flow::Err)?;
                if !a.is_pure_double()
                    && let Ok(wa) = a.get_wide()
                {
                    let wc = match code {
                        OpCode::Not => (wa == 0) as i64,
                        _ => !wa,
                    };
                    stack.push(interp.heap().int(wc));
                    continue;
                }
                let da = match a.get_double() {
                    Ok(d) => d,
                    Err(msg) => return Err(interp.error(msg)),
                };
                if *code == OpCode::BitNot {
                    return Err(
                        interp.error("Got floating-point value where integer was expected")
                    );
                }
                let dc = if da == 0.0 { 1.0 } else { 0.0 };
                stack.push(interp.heap().double(dc));
            }
            OpCode::UnaryMinus | OpCode::UnaryPlus => {
                let a = stack.pop().ok_or(Flow::Err)?;
                if !a.is_pure_double()
                    && let Ok(wa) = a.get_wide()
                {
                    let wc = match code {
                        OpCode::UnaryMinus => wa.wrapping_neg(),
                        _ => wa,
                    };
                    stack.push(interp.heap().int(wc));
                    continue;
                }
                let da = match a.get_double() {
                    Ok(d) => d,
                    Err(msg) => return Err(interp.error(msg)),
                };
                let dc = match code {
                    OpCode::UnaryMinus => -da,
                    _ => da,
                };
                stack.push(interp.heap().double(dc));
            }
            OpCode::Ternary => return Err(interp.error("Invalid expression")),
            _ => {
                // The arithmetic group: integers first, doubles second.
                let b = stack.pop().ok_or(Flow::Err)?;
                let a = stack.pop().ok_or(Flow::Err)?;
                let ints = if a.is_pure_double() || b.is_pure_double() {
                    None
                } else {
                    match (a.get_wide(), b.get_wide()) {
                        (Ok(wa), Ok(wb)) => Some((wa, wb)),
                        _ => None,
                    }
                };
                if let Some((wa, wb)) = ints {
                    let wc = match code {
                        OpCode::Add => wa.wrapping_add(wb),
                        OpCode::Sub => wa.wrapping_sub(wb),
                        OpCode::Mul => wa.wrapping_mul(wb),
                        OpCode::Lt => (wa < wb) as i64,
                        OpCode::Gt => (wa > wb) as i64,
                        OpCode::Le => (wa <= wb) as i64,
                        OpCode::Ge => (wa >= wb) as i64,
                        OpCode::NumEq => (wa == wb) as i64,
                        OpCode::NumNe => (wa != wb) as i64,
                        OpCode::BitAnd => wa & wb,
                        OpCode::BitXor => wa ^ wb,
                        OpCode::BitOr => wa | wb,
                        OpCode::LogicAnd => (wa != 0 && wb != 0) as i64,
                        OpCode::LogicOr => (wa != 0 || wb != 0) as i64,
                        OpCode::LShift => wa.wrapping_shl(wb as u32),
                        OpCode::RShift => wa.wrapping_shr(wb as u32),
                        OpCode::Div => {
                            if wb == 0 {
                                return Err(interp.error("Division by zero"));
                            }
                            wa.wrapping_div(wb)
                        }
                        OpCode::Mod => {
                            if wb == 0 {
                                return Err(interp.error("Division by zero"));
                            }
                            wa.wrapping_rem(wb)
                        }
                        // Rotations work on the low 32 bits, treated as
                        // unsigned, and wrap modulo 32.
                        OpCode::RotL => (wa as u32).rotate_left(wb as u32) as i64,
                        OpCode::RotR => (wa as u32).rotate_right(wb as u32) as i64,
                        _ => 0,
                    };
                    stack.push(interp.heap().int(wc));
                    continue;
                }
                let da = match a.get_double() {
                    Ok(d) => d,
                    Err(msg) => return Err(interp.error(msg)),
                };
                let db = match b.get_double() {
                    Ok(d) => d,
                    Err(msg) => return Err(interp.error(msg)),
                };
                if integer_only_on_doubles(*code) {
                    return Err(
                        interp.error("Got floating-point value where integer was expected")
                    );
                }
                let dc = match code {
                    OpCode::Add => da + db,
                    OpCode::Sub => da - db,
                    OpCode::Mul => da * db,
                    OpCode::Lt => (da < db) as i64 as f64,
                    OpCode::Gt => (da > db) as i64 as f64,
                    OpCode::Le => (da <= db) as i64 as f64,
                    OpCode::Ge => (da >= db) as i64 as f64,
                    OpCode::NumEq => (da == db) as i64 as f64,
                    OpCode::NumNe => (da != db) as i64 as f64,
                    OpCode::LogicAnd => (da != 0.0 && db != 0.0) as i64 as f64,
                    OpCode::LogicOr => (da != 0.0 || db != 0.0) as i64 as f64,
                    OpCode::Div => {
                        if db == 0.0 {
                            return Err(interp.error("Division by zero"));
                        }
                        da / db
                    }
                    _ => 0.0,
                };
                stack.push(interp.heap().double(dc));
            }
        }
    }
    stack.pop().ok_or(Flow::Err)
}

/// Evaluate an expression down to a boolean, the way the control-flow
/// commands consume conditions.
pub(crate) fn eval_expr_bool(interp: &mut Interp, expr_obj: &Value) -> Result<bool, Flow> {
    let result = eval_expr(interp, expr_obj)?;
    if let Ok(w) = result.get_wide() {
        return Ok(w != 0);
    }
    match result.get_double() {
        Ok(d) => Ok(d != 0.0),
        Err(msg) => Err(interp.error(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interp;

    /// Expected outcome for one expression.
    enum Expect {
        Result(&'static str),
        SpecificError(&'static str),
    }
    use Expect::*;

    fn run_expr_cases(cases: Vec<(&str, Expect)>) {
        let mut interp = Interp::new();
        for (i, (src, expected)) in cases.iter().enumerate() {
            let v = interp.heap().str(*src);
            let got = eval_expr(&mut interp, &v);
            match (got, expected) {
                (Ok(value), Result(want)) => {
                    assert_eq!(
                        &*value.as_str(),
                        *want,
                        "expr case #{} for {:?}",
                        i + 1,
                        src
                    );
                }
                (Err(_), SpecificError(want)) => {
                    let msg = interp.result().as_str();
                    assert!(
                        msg.contains(want),
                        "expr case #{} for {:?}: error {:?} should contain {:?}",
                        i + 1,
                        src,
                        msg,
                        want
                    );
                }
                (Ok(value), SpecificError(want)) => panic!(
                    "expr case #{} for {:?}: expected error {:?}, got {:?}",
                    i + 1,
                    src,
                    want,
                    value
                ),
                (Err(_), Result(want)) => panic!(
                    "expr case #{} for {:?}: expected {:?}, got error {:?}",
                    i + 1,
                    src,
                    want,
                    interp.result().as_str()
                ),
            }
        }
    }

    #[test]
    fn test_integer_arithmetic() {
        run_expr_cases(vec![
            ("1+2", Result("3")),
            ("2*3+4", Result("10")),
            ("2+3*4", Result("14")),
            ("(2+3)*4", Result("20")),
            ("10-3-2", Result("5")),
            ("7/2", Result("3")),
            ("7%3", Result("1")),
            ("3/2", Result("1")),
            ("1<<3", Result("8")),
            ("16>>2", Result("4")),
            ("5&3", Result("1")),
            ("5|3", Result("7")),
            ("5^3", Result("6")),
            ("~0", Result("-1")),
            ("!0", Result("1")),
            ("!5", Result("0")),
            ("42", Result("42")),
            ("-5", Result("-5")),
            // Base prefixes only come in through string operands; the number
            // lexer itself is decimal.
            ("\"0x10\" + 1", Result("17")),
        ])
    }

    #[test]
    fn test_comparisons_and_logic() {
        run_expr_cases(vec![
            ("1 < 2", Result("1")),
            ("2 < 1", Result("0")),
            ("2 <= 2", Result("1")),
            ("3 > 2", Result("1")),
            ("3 >= 4", Result("0")),
            ("5 == 5", Result("1")),
            ("5 != 5", Result("0")),
            ("1 && 2", Result("1")),
            ("1 && 0", Result("0")),
            ("0 || 3", Result("1")),
            ("0 || 0", Result("0")),
            // String comparison is always byte-wise; string operands must be
            // quoted or braced.
            ("\"abc\" eq \"abc\"", Result("1")),
            ("\"abc\" ne \"abd\"", Result("1")),
            ("{a b} eq {a b}", Result("1")),
            // Numeric vs byte equality differ.
            ("010 == 8", Result("1")),
            ("010 eq 8", Result("0")),
        ])
    }

    #[test]
    fn test_double_promotion() {
        run_expr_cases(vec![
            ("3/2.0", Result("1.5")),
            ("1.5+1", Result("2.5")),
            ("2.0*3", Result("6.0")),
            ("1.0 % 2", SpecificError("floating-point value where integer was expected")),
            ("1.5 & 2", SpecificError("floating-point value where integer was expected")),
            ("1.0 << 2", SpecificError("floating-point value where integer was expected")),
            ("1/0", SpecificError("Division by zero")),
            ("1%0", SpecificError("Division by zero")),
            ("1.0/0.0", SpecificError("Division by zero")),
        ])
    }

    #[test]
    fn test_computed_doubles_stay_doubles() {
        // A computed double has no string form, so it cannot silently turn
        // back into an integer even when it looks like one.
        run_expr_cases(vec![
            ("(4/2.0) % 2", SpecificError("floating-point value where integer was expected")),
            ("4/2.0", Result("2.0")),
        ])
    }

    #[test]
    fn test_rotations_wrap_modulo_32() {
        run_expr_cases(vec![
            ("1<<<1", Result("2")),
            ("1<<<32", Result("1")),
            ("1<<<33", Result("2")),
            ("1>>>1", Result("2147483648")),
            ("2147483648>>>31", Result("1")),
            ("1>>>32", Result("1")),
        ])
    }

    #[test]
    fn test_compile_errors() {
        run_expr_cases(vec![
            ("1 +", SpecificError("Invalid expression")),
            ("+ 1", SpecificError("Invalid expression")),
            ("1 2", SpecificError("Invalid expression")),
            ("", SpecificError("Invalid expression")),
            ("(1", SpecificError("Missing close parenthesis")),
            ("1)", SpecificError("Unexpected close parenthesis")),
            ("1 @ 2", SpecificError("Syntax error in expression")),
            // The ternary operator is parsed but reserved.
            ("1 ? 2", SpecificError("Invalid expression")),
        ])
    }

    #[test]
    fn test_integer_literal_round_trip() {
        for n in ["0", "1", "-17", "9223372036854775807"] {
            let mut interp = Interp::new();
            let v = interp.heap().str(n);
            let out = eval_expr(&mut interp, &v).expect("literal evaluates");
            assert_eq!(&*out.as_str(), n);
        }
    }

    #[test]
    fn test_variables_and_commands_in_expressions() {
        let mut interp = Interp::new();
        interp.eval("set n 4").unwrap();
        let v = interp.heap().str("$n * 2 + [expr {1 + 1}]");
        let out = eval_expr(&mut interp, &v).unwrap();
        assert_eq!(&*out.as_str(), "10");
        // Unknown variables fail with the resolution error.
        let bad = interp.heap().str("$missing + 1");
        assert!(eval_expr(&mut interp, &bad).is_err());
        assert!(interp.result().as_str().contains("no such variable"));
    }

    #[test]
    fn test_logical_ops_do_not_short_circuit() {
        let mut interp = Interp::new();
        interp.eval("set hits 0").unwrap();
        let v = interp.heap().str("0 && [incr hits]");
        let out = eval_expr(&mut interp, &v).unwrap();
        assert_eq!(&*out.as_str(), "0");
        // The right-hand side ran anyway.
        interp.eval("set hits").unwrap();
        assert_eq!(&*interp.result().as_str(), "1");
    }

    #[test]
    fn test_program_caching() {
        let mut interp = Interp::new();
        let v = interp.heap().str("1 + 1");
        let first = expr_of(&mut interp, &v).unwrap();
        let second = expr_of(&mut interp, &v).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(v.type_name(), "expression");
    }

    #[test]
    fn test_expr_bool() {
        let mut interp = Interp::new();
        let t = interp.heap().str("3 > 2");
        assert_eq!(eval_expr_bool(&mut interp, &t), Ok(true));
        let f = interp.heap().str("0.0");
        assert_eq!(eval_expr_bool(&mut interp, &f), Ok(false));
        let d = interp.heap().str("0.5");
        assert_eq!(eval_expr_bool(&mut interp, &d), Ok(true));
    }
}
