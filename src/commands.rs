//! The core command set. Every command takes the interpreter and the
//! argument vector (its own name included) and finishes with a completion
//! code; the payload - result or error message - travels in the interpreter
//! result. Implementations come first, the registration table after, and a
//! couple of core procedures written in the language itself close the file.

use std::rc::Rc;

use crate::expr::{eval_expr, eval_expr_bool};
use crate::interp::{Interp, NativeFn};
use crate::refs;
use crate::value::{Rep, Value};
use crate::{CmdResult, Flow, Retcode};

// ----- helpers -------------------------------------------------------------

/// Glob-style pattern match: `*`, `?`, `[...]` classes with ranges and `^`
/// negation, backslash escapes.
pub(crate) fn glob_match(pattern: &[u8], string: &[u8], nocase: bool) -> bool {
    let fold = |c: u8| if nocase { c.to_ascii_lowercase() } else { c };
    let mut p = 0usize;
    let mut s = 0usize;
    while p < pattern.len() {
        match pattern[p] {
            b'*' => {
                while pattern.get(p + 1) == Some(&b'*') {
                    p += 1;
                }
                if p + 1 >= pattern.len() {
                    return true;
                }
                for i in s..string.len() {
                    if glob_match(&pattern[p + 1..], &string[i..], nocase) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                if s >= string.len() {
                    return false;
                }
                s += 1;
            }
            b'[' => {
                let Some(&c) = string.get(s) else {
                    return false;
                };
                p += 1;
                let negate = pattern.get(p) == Some(&b'^');
                if negate {
                    p += 1;
                }
                let mut matched = false;
                loop {
                    match pattern.get(p) {
                        Some(b'\\') => {
                            p += 1;
                            if pattern.get(p) == Some(&c) {
                                matched = true;
                            }
                        }
                        Some(b']') => break,
                        None => {
                            p -= 1;
                            break;
                        }
                        Some(&pc) => {
                            if pattern.get(p + 1) == Some(&b'-') && p + 2 < pattern.len() {
                                let lo = fold(pc);
                                let hi = fold(pattern[p + 2]);
                                p += 2;
                                if fold(c) >= lo && fold(c) <= hi {
                                    matched = true;
                                }
                            } else if fold(pc) == fold(c) {
                                matched = true;
                            }
                        }
                    }
                    p += 1;
                }
                if negate {
                    matched = !matched;
                }
                if !matched {
                    return false;
                }
                s += 1;
            }
            mut c => {
                if c == b'\\' && p + 1 < pattern.len() {
                    p += 1;
                    c = pattern[p];
                }
                let Some(&sc) = string.get(s) else {
                    return false;
                };
                if fold(c) != fold(sc) {
                    return false;
                }
                s += 1;
            }
        }
        p += 1;
        if s >= string.len() {
            break;
        }
    }
    p >= pattern.len() && s >= string.len()
}

/// Concatenation used by `concat`, `eval`, `expr` and `uplevel` with several
/// script arguments: pure lists join element-wise, anything else glues the
/// whitespace-trimmed string forms with single spaces.
pub(crate) fn concat_values(interp: &mut Interp, objs: &[Value]) -> Value {
    let all_pure_lists = objs
        .iter()
        .all(|o| !o.has_string() && matches!(&*o.rep(), Rep::List(_)));
    if all_pure_lists {
        let mut out = Vec::new();
        for o in objs {
            out.extend(o.list_elements(interp.heap()));
        }
        interp.heap().list(out)
    } else {
        let mut s = String::new();
        let n = objs.len();
        for (i, o) in objs.iter().enumerate() {
            let part = o.as_str();
            let trimmed = part.trim_matches([' ', '\t', '\n']);
            s.push_str(trimmed);
            if !trimmed.is_empty() && i + 1 != n {
                s.push(' ');
            }
        }
        interp.heap().str(s)
    }
}

fn rel_to_abs(len: i64, index: i64) -> i64 {
    if index >= len {
        len - 1
    } else if index < 0 {
        let abs = len + index;
        if abs < 0 {
            0
        } else if abs >= len {
            len - 1
        } else {
            abs
        }
    } else {
        index
    }
}

// ----- binding -------------------------------------------------------------

fn cmd_set(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "varName ?newValue?"));
    }
    if argv.len() == 2 {
        let Some(v) = interp.get_variable(&argv[1], true) else {
            return Err(Flow::Err);
        };
        interp.set_result(v);
        return Ok(());
    }
    interp.set_variable(&argv[1], argv[2].clone())?;
    interp.set_result(argv[2].clone());
    Ok(())
}

fn cmd_unset(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "varName ?varName ...?"));
    }
    for name in &argv[1..] {
        interp.unset_variable(name, true)?;
    }
    Ok(())
}

fn cmd_incr(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "varName ?increment?"));
    }
    let increment = if argv.len() == 3 {
        interp.wide_of(&argv[2])?
    } else {
        1
    };
    let Some((val, shared)) = interp.var_value_shared(&argv[1], true) else {
        return Err(Flow::Err);
    };
    let w = interp.wide_of(&val)?;
    let result = if shared {
        let fresh = interp.heap().int(w.wrapping_add(increment));
        interp.set_variable(&argv[1], fresh.clone())?;
        fresh
    } else {
        val.set_wide(w.wrapping_add(increment));
        val
    };
    interp.set_result(result);
    Ok(())
}

fn cmd_proc(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 4 {
        return Err(interp.wrong_num_args(1, argv, "name arglist body"));
    }
    let arg_list_len = argv[2].list_len(interp.heap()) as i32;
    let mut arity_min = arg_list_len + 1;
    let mut arity_max = arg_list_len + 1;
    if arg_list_len > 0
        && let Some(last) = argv[2].list_index(interp.heap(), (arg_list_len - 1) as i64)
        && &*last.as_str() == "args"
    {
        arity_min -= 1;
        arity_max = -1;
    }
    let name = argv[1].as_str().to_string();
    interp.create_procedure(&name, argv[2].clone(), argv[3].clone(), arity_min, arity_max);
    Ok(())
}

fn cmd_rename(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "oldName newName"));
    }
    let old = argv[1].as_str().to_string();
    let new = argv[2].as_str().to_string();
    if !interp.rename_command(&old, &new) {
        let msg = format!("can't rename \"{old}\": command doesn't exist");
        return Err(interp.error(msg));
    }
    Ok(())
}

fn cmd_upvar(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let usage = "?level? otherVar localVar ?otherVar localVar ...?";
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, usage));
    }
    let first = argv[1].as_str();
    let explicit_level = argv.len() > 3
        && (first.starts_with(|c: char| c.is_ascii_digit()) || first.starts_with('#'));
    let (target, pairs) = if explicit_level {
        (interp.frame_by_level(Some(&argv[1]))?, &argv[2..])
    } else {
        (interp.frame_by_level(None)?, &argv[1..])
    };
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err(interp.wrong_num_args(1, argv, usage));
    }
    for pair in pairs.chunks_exact(2) {
        interp.set_variable_link(&pair[1], &pair[0], target)?;
    }
    Ok(())
}

fn cmd_global(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "varName ?varName ...?"));
    }
    // At toplevel the names already live in the global frame.
    if interp.num_levels == 0 {
        return Ok(());
    }
    for name in &argv[1..] {
        interp.set_variable_link(name, name, 0)?;
    }
    Ok(())
}

// ----- control flow --------------------------------------------------------

fn cmd_if(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let usage = "condition ?then? trueBody ?elseif ...? ?else? falseBody";
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(1, argv, usage));
    }
    let mut current = 1usize;
    loop {
        if current >= argv.len() {
            return Err(interp.wrong_num_args(1, argv, usage));
        }
        let cond = eval_expr_bool(interp, &argv[current])?;
        current += 1;
        if current >= argv.len() {
            return Err(interp.wrong_num_args(1, argv, usage));
        }
        if argv[current].eq_immediate("then") {
            current += 1;
        }
        if current >= argv.len() {
            return Err(interp.wrong_num_args(1, argv, usage));
        }
        if cond {
            return interp.eval_value(&argv[current]);
        }
        current += 1;
        if current >= argv.len() {
            return Ok(());
        }
        let falsebody = current;
        current += 1;
        if argv[falsebody].eq_immediate("else") {
            if current != argv.len() - 1 {
                return Err(interp.wrong_num_args(1, argv, usage));
            }
            return interp.eval_value(&argv[current]);
        } else if argv[falsebody].eq_immediate("elseif") {
            continue;
        } else if falsebody != argv.len() - 1 {
            return Err(interp.wrong_num_args(1, argv, usage));
        }
        return interp.eval_value(&argv[falsebody]);
    }
}

fn cmd_while(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "condition body"));
    }
    loop {
        if !eval_expr_bool(interp, &argv[1])? {
            break;
        }
        match interp.eval_value(&argv[2]) {
            Ok(()) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(e) => return Err(e),
        }
    }
    interp.set_empty_result();
    Ok(())
}

fn cmd_for(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 5 {
        return Err(interp.wrong_num_args(1, argv, "start test next body"));
    }
    interp.eval_value(&argv[1])?;
    loop {
        if !eval_expr_bool(interp, &argv[2])? {
            break;
        }
        match interp.eval_value(&argv[4]) {
            Ok(()) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(e) => return Err(e),
        }
        match interp.eval_value(&argv[3]) {
            Ok(()) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(e) => return Err(e),
        }
    }
    interp.set_empty_result();
    Ok(())
}

fn cmd_foreach(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 4 {
        return Err(interp.wrong_num_args(1, argv, "varList list body"));
    }
    let vars = argv[1].list_elements(interp.heap());
    if vars.is_empty() {
        return Err(interp.error("foreach varlist is empty"));
    }
    let items = argv[2].list_elements(interp.heap());
    let mut idx = 0usize;
    while idx < items.len() {
        for var in &vars {
            let val = match items.get(idx) {
                Some(v) => v.clone(),
                None => interp.heap().empty(),
            };
            idx += 1;
            interp.set_variable(var, val)?;
        }
        match interp.eval_value(&argv[3]) {
            Ok(()) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(e) => return Err(e),
        }
    }
    interp.set_empty_result();
    Ok(())
}

fn cmd_break(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(1, argv, ""));
    }
    Err(Flow::Break)
}

fn cmd_continue(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(1, argv, ""));
    }
    Err(Flow::Continue)
}

fn cmd_return(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    match argv.len() {
        1 => Err(Flow::Return),
        2 => {
            interp.set_result(argv[1].clone());
            interp.return_code = Retcode::Ok;
            Err(Flow::Return)
        }
        3 | 4 => {
            let code = match argv[2].get_retcode() {
                Ok(code) => code,
                Err(msg) => return Err(interp.error(msg)),
            };
            interp.return_code = code;
            if argv.len() == 4 {
                interp.set_result(argv[3].clone());
            }
            Err(Flow::Return)
        }
        _ => Err(interp.wrong_num_args(1, argv, "?-code code? ?result?")),
    }
}

fn cmd_catch(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "script ?varName?"));
    }
    let code = match interp.eval_value(&argv[1]) {
        Ok(()) => 0,
        Err(f) => f.retcode().as_wide(),
    };
    if argv.len() == 3 {
        let caught = interp.result().clone();
        interp.set_variable(&argv[2], caught)?;
    }
    let v = interp.heap().int(code);
    interp.set_result(v);
    Ok(())
}

// ----- evaluation ----------------------------------------------------------

fn cmd_eval(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() == 2 {
        interp.eval_value(&argv[1])
    } else if argv.len() > 2 {
        let script = concat_values(interp, &argv[1..]);
        interp.eval_value(&script)
    } else {
        Err(interp.wrong_num_args(1, argv, "script ?...?"))
    }
}

fn cmd_uplevel(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "?level? script ?...?"));
    }
    let first = argv[1].as_str();
    let explicit_level = argv.len() >= 3
        && (first.starts_with(|c: char| c.is_ascii_digit()) || first.starts_with('#'));
    let (target, scripts) = if explicit_level {
        (interp.frame_by_level(Some(&argv[1]))?, &argv[2..])
    } else {
        (interp.frame_by_level(None)?, &argv[1..])
    };
    let script = if scripts.len() == 1 {
        scripts[0].clone()
    } else {
        concat_values(interp, scripts)
    };
    interp.with_frame(target, |interp| interp.eval_value(&script))
}

fn cmd_expr(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let result = if argv.len() == 2 {
        eval_expr(interp, &argv[1])?
    } else if argv.len() > 2 {
        let text = concat_values(interp, &argv[1..]);
        eval_expr(interp, &text)?
    } else {
        return Err(interp.wrong_num_args(1, argv, "expression ?...?"));
    };
    interp.set_result(result);
    Ok(())
}

fn cmd_subst(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    use crate::parser::{SUBST_NOCMD, SUBST_NOESC, SUBST_NOVAR};
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(
            1,
            argv,
            "?-nobackslashes? ?-nocommands? ?-novariables? string",
        ));
    }
    let mut flags = 0;
    for opt in &argv[1..argv.len() - 1] {
        if opt.eq_immediate("-nobackslashes") {
            flags |= SUBST_NOESC;
        } else if opt.eq_immediate("-novariables") {
            flags |= SUBST_NOVAR;
        } else if opt.eq_immediate("-nocommands") {
            flags |= SUBST_NOCMD;
        } else {
            let msg = format!(
                "bad option \"{}\": must be -nobackslashes, -nocommands, or -novariables",
                opt.as_str()
            );
            return Err(interp.error(msg));
        }
    }
    let out = interp.subst_value(&argv[argv.len() - 1], flags)?;
    interp.set_result(out);
    Ok(())
}

// ----- arithmetic ----------------------------------------------------------

fn add_mul(interp: &mut Interp, argv: &[Value], is_add: bool) -> CmdResult {
    let mut res: i64 = if is_add { 0 } else { 1 };
    let mut idx = 1usize;
    let mut switch_to_double = false;
    while idx < argv.len() {
        match argv[idx].get_wide() {
            Ok(w) => {
                res = if is_add {
                    res.wrapping_add(w)
                } else {
                    res.wrapping_mul(w)
                };
                idx += 1;
            }
            Err(_) => {
                switch_to_double = true;
                break;
            }
        }
    }
    if switch_to_double {
        let mut dres = res as f64;
        while idx < argv.len() {
            let d = interp.double_of(&argv[idx])?;
            dres = if is_add { dres + d } else { dres * d };
            idx += 1;
        }
        let v = interp.heap().double(dres);
        interp.set_result(v);
    } else {
        let v = interp.heap().int(res);
        interp.set_result(v);
    }
    Ok(())
}

fn sub_div(interp: &mut Interp, argv: &[Value], is_sub: bool) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "number ?number ...?"));
    }
    // With a single operand `-` negates and `/` inverts.
    if argv.len() == 2 {
        let v = match argv[1].get_wide() {
            Ok(w) => {
                if is_sub {
                    interp.heap().int(w.wrapping_neg())
                } else {
                    interp.heap().double(1.0 / w as f64)
                }
            }
            Err(_) => {
                let d = interp.double_of(&argv[1])?;
                interp.heap().double(if is_sub { -d } else { 1.0 / d })
            }
        };
        interp.set_result(v);
        return Ok(());
    }
    match argv[1].get_wide() {
        Ok(first) => {
            let mut res = first;
            let mut idx = 2usize;
            while idx < argv.len() {
                match argv[idx].get_wide() {
                    Ok(w) => {
                        if is_sub {
                            res = res.wrapping_sub(w);
                        } else {
                            if w == 0 {
                                return Err(interp.error("Division by zero"));
                            }
                            res = res.wrapping_div(w);
                        }
                        idx += 1;
                    }
                    Err(_) => {
                        let mut dres = res as f64;
                        while idx < argv.len() {
                            let d = interp.double_of(&argv[idx])?;
                            dres = if is_sub { dres - d } else { dres / d };
                            idx += 1;
                        }
                        let v = interp.heap().double(dres);
                        interp.set_result(v);
                        return Ok(());
                    }
                }
            }
            let v = interp.heap().int(res);
            interp.set_result(v);
            Ok(())
        }
        Err(_) => {
            let mut dres = interp.double_of(&argv[1])?;
            for arg in &argv[2..] {
                let d = interp.double_of(arg)?;
                dres = if is_sub { dres - d } else { dres / d };
            }
            let v = interp.heap().double(dres);
            interp.set_result(v);
            Ok(())
        }
    }
}

fn cmd_add(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    add_mul(interp, argv, true)
}

fn cmd_mul(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    add_mul(interp, argv, false)
}

fn cmd_sub(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    sub_div(interp, argv, true)
}

fn cmd_div(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    sub_div(interp, argv, false)
}

// ----- lists ---------------------------------------------------------------

fn cmd_list(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let v = interp.heap().list(argv[1..].to_vec());
    interp.set_result(v);
    Ok(())
}

fn cmd_lindex(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(1, argv, "listValue index ?...?"));
    }
    let mut obj = argv[1].clone();
    for idx_arg in &argv[2..] {
        let index = interp.index_of(idx_arg)?;
        match obj.list_index(interp.heap(), index) {
            Some(ele) => obj = ele,
            None => {
                // Out of range reads produce the empty result.
                interp.set_empty_result();
                return Ok(());
            }
        }
    }
    interp.set_result(obj);
    Ok(())
}

fn cmd_llength(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(1, argv, "listValue"));
    }
    let len = argv[1].list_len(interp.heap()) as i64;
    let v = interp.heap().int(len);
    interp.set_result(v);
    Ok(())
}

fn cmd_lappend(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "listVar ?element ...?"));
    }
    let (list, shared) = match interp.var_value_shared(&argv[1], false) {
        Some(pair) => pair,
        None => {
            let fresh = interp.heap().list(Vec::new());
            interp.set_variable(&argv[1], fresh.clone())?;
            (fresh, false)
        }
    };
    let list = if shared {
        list.duplicate(interp.heap())
    } else {
        list
    };
    for ele in &argv[2..] {
        list.list_push(interp.heap(), ele.clone());
    }
    if shared {
        interp.set_variable(&argv[1], list.clone())?;
    }
    interp.set_result(list);
    Ok(())
}

fn set_list_index(
    interp: &mut Interp,
    var_name: &Value,
    indexes: &[Value],
    newval: Value,
) -> CmdResult {
    let Some((root, shared)) = interp.var_value_shared(var_name, true) else {
        return Err(Flow::Err);
    };
    let root = if shared {
        root.duplicate(interp.heap())
    } else {
        root
    };
    let mut cur = root.clone();
    for idx_arg in &indexes[..indexes.len() - 1] {
        let index = interp.index_of(idx_arg)?;
        let next = match cur.list_index_for_write(interp.heap(), index) {
            Some(v) => v,
            None => return Err(interp.error("list index out of range")),
        };
        cur.invalidate_string();
        cur = next;
    }
    let index = interp.index_of(&indexes[indexes.len() - 1])?;
    if !cur.list_set_index(interp.heap(), index, newval) {
        return Err(interp.error("list index out of range"));
    }
    cur.invalidate_string();
    root.invalidate_string();
    if shared {
        interp.set_variable(var_name, root.clone())?;
    }
    interp.set_result(root);
    Ok(())
}

fn cmd_lset(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(1, argv, "listVar ?index...? newVal"));
    }
    if argv.len() == 3 {
        interp.set_variable(&argv[1], argv[2].clone())?;
        interp.set_result(argv[2].clone());
        return Ok(());
    }
    set_list_index(
        interp,
        &argv[1],
        &argv[2..argv.len() - 1],
        argv[argv.len() - 1].clone(),
    )
}

fn cmd_append(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "varName ?string ...?"));
    }
    if argv.len() == 2 {
        let Some(v) = interp.get_variable(&argv[1], true) else {
            return Err(Flow::Err);
        };
        interp.set_result(v);
        return Ok(());
    }
    let (target, shared) = match interp.var_value_shared(&argv[1], false) {
        Some(pair) => pair,
        None => {
            let fresh = interp.heap().empty();
            interp.set_variable(&argv[1], fresh.clone())?;
            (fresh, false)
        }
    };
    let target = if shared {
        target.duplicate(interp.heap())
    } else {
        target
    };
    for part in &argv[2..] {
        target.append_value(part);
    }
    if shared {
        interp.set_variable(&argv[1], target.clone())?;
    }
    interp.set_result(target);
    Ok(())
}

fn cmd_concat(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let v = concat_values(interp, &argv[1..]);
    interp.set_result(v);
    Ok(())
}

// ----- strings -------------------------------------------------------------

fn string_range(
    interp: &mut Interp,
    strv: &Value,
    firstv: &Value,
    lastv: &Value,
) -> Result<Value, Flow> {
    let first = interp.index_of(firstv)?;
    let last = interp.index_of(lastv)?;
    let s = strv.as_str();
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    if len == 0 {
        return Ok(interp.heap().empty());
    }
    let first = rel_to_abs(len, first);
    let last = rel_to_abs(len, last);
    let range_len = (last - first + 1).max(0) as usize;
    let out: String = chars
        .into_iter()
        .skip(first.max(0) as usize)
        .take(range_len)
        .collect();
    Ok(interp.heap().str(out))
}

fn cmd_string(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "option ?arguments ...?"));
    }
    if argv[1].eq_immediate("length") {
        if argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "string"));
        }
        let len = argv[2].strlen() as i64;
        let v = interp.heap().int(len);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("compare") {
        if argv.len() != 4 {
            return Err(interp.wrong_num_args(2, argv, "string1 string2"));
        }
        let order = match argv[2].as_str().cmp(&argv[3].as_str()) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        };
        let v = interp.heap().int(order);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("match") {
        let nocase = argv.len() == 5 && argv[2].eq_immediate("-nocase");
        if (argv.len() != 4 && argv.len() != 5) || (argv.len() == 5 && !nocase) {
            return Err(interp.wrong_num_args(2, argv, "?-nocase? pattern string"));
        }
        let base = if nocase { 3 } else { 2 };
        let matched = glob_match(
            argv[base].as_str().as_bytes(),
            argv[base + 1].as_str().as_bytes(),
            nocase,
        );
        let v = interp.heap().int(matched as i64);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("equal") {
        if argv.len() != 4 {
            return Err(interp.wrong_num_args(2, argv, "string1 string2"));
        }
        let eq = argv[2].eq_bytes(&argv[3]) as i64;
        let v = interp.heap().int(eq);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("range") {
        if argv.len() != 5 {
            return Err(interp.wrong_num_args(2, argv, "string first last"));
        }
        let out = string_range(interp, &argv[2], &argv[3], &argv[4])?;
        interp.set_result(out);
        Ok(())
    } else {
        let msg = format!(
            "bad option \"{}\": must be length, compare, match, equal, range",
            argv[1].as_str()
        );
        Err(interp.error(msg))
    }
}

// ----- dictionaries --------------------------------------------------------

fn cmd_dict(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "option ?arguments ...?"));
    }
    if argv[1].eq_immediate("create") {
        if argv.len() % 2 != 0 {
            return Err(interp.wrong_num_args(2, argv, "?key value ...?"));
        }
        let v = interp.heap().dict(&argv[2..]);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("get") {
        if argv.len() < 3 {
            return Err(interp.wrong_num_args(2, argv, "dictionary ?key ...?"));
        }
        let v = interp.dict_keys_vector(&argv[2], &argv[3..], true)?;
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("set") {
        if argv.len() < 5 {
            return Err(interp.wrong_num_args(2, argv, "varName key ?key ...? value"));
        }
        interp.set_dict_keys(
            &argv[2],
            &argv[3..argv.len() - 1],
            Some(argv[argv.len() - 1].clone()),
        )
    } else if argv[1].eq_immediate("unset") {
        if argv.len() < 4 {
            return Err(interp.wrong_num_args(2, argv, "varName key ?key ...?"));
        }
        interp.set_dict_keys(&argv[2], &argv[3..], None)
    } else if argv[1].eq_immediate("exists") {
        if argv.len() < 3 {
            return Err(interp.wrong_num_args(2, argv, "dictionary ?key ...?"));
        }
        let exists = interp.dict_keys_vector(&argv[2], &argv[3..], true).is_ok();
        let v = interp.heap().int(exists as i64);
        interp.set_result(v);
        Ok(())
    } else {
        let msg = format!(
            "bad option \"{}\": must be create, get, set",
            argv[1].as_str()
        );
        Err(interp.error(msg))
    }
}

// ----- arrays over dictionary variables ------------------------------------

fn array_pairs(interp: &mut Interp, name: &Value) -> Result<Vec<(Value, Value)>, Flow> {
    let Some(value) = interp.get_variable(name, false) else {
        return Ok(Vec::new());
    };
    let pairs = value.dict_pairs(interp.heap());
    match pairs {
        Ok(pairs) => Ok(pairs),
        Err(m) => Err(interp.error(m)),
    }
}

fn cmd_array(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "option arrayName ?arg ...?"));
    }
    if argv[1].eq_immediate("get") {
        if argv.len() != 3 && argv.len() != 4 {
            return Err(interp.wrong_num_args(2, argv, "arrayName ?pattern?"));
        }
        let pattern = argv.get(3).map(|p| p.as_str());
        let mut flat = Vec::new();
        for (k, v) in array_pairs(interp, &argv[2])? {
            if let Some(pat) = &pattern
                && !glob_match(pat.as_bytes(), k.as_str().as_bytes(), false)
            {
                continue;
            }
            flat.push(k);
            flat.push(v);
        }
        let v = interp.heap().list(flat);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("set") {
        if argv.len() != 4 {
            return Err(interp.wrong_num_args(2, argv, "arrayName list"));
        }
        let elements = argv[3].list_elements(interp.heap());
        if elements.len() % 2 != 0 {
            return Err(interp.error("list must have an even number of elements"));
        }
        for pair in elements.chunks_exact(2) {
            interp.set_dict_keys(&argv[2], &pair[..1], Some(pair[1].clone()))?;
        }
        interp.set_empty_result();
        Ok(())
    } else if argv[1].eq_immediate("names") {
        if argv.len() != 3 && argv.len() != 4 {
            return Err(interp.wrong_num_args(2, argv, "arrayName ?pattern?"));
        }
        let pattern = argv.get(3).map(|p| p.as_str());
        let mut names = Vec::new();
        for (k, _) in array_pairs(interp, &argv[2])? {
            if let Some(pat) = &pattern
                && !glob_match(pat.as_bytes(), k.as_str().as_bytes(), false)
            {
                continue;
            }
            names.push(k);
        }
        let v = interp.heap().list(names);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("exists") {
        if argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "arrayName"));
        }
        let exists = match interp.get_variable(&argv[2], false) {
            Some(value) => value.ensure_dict(interp.heap()).is_ok(),
            None => false,
        };
        let v = interp.heap().int(exists as i64);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("size") {
        if argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "arrayName"));
        }
        let size = array_pairs(interp, &argv[2])?.len() as i64;
        let v = interp.heap().int(size);
        interp.set_result(v);
        Ok(())
    } else {
        let msg = format!(
            "bad option \"{}\": must be exists, get, names, set, size",
            argv[1].as_str()
        );
        Err(interp.error(msg))
    }
}

// ----- references ----------------------------------------------------------

fn cmd_ref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "string ?finalizer?"));
    }
    let finalizer = argv.get(2).cloned();
    let v = refs::new_reference(interp, argv[1].clone(), finalizer);
    interp.set_result(v);
    Ok(())
}

fn cmd_getref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(1, argv, "reference"));
    }
    let id = refs::get_reference_id(interp, &argv[1])?;
    let Some(record) = interp.references.get(&id) else {
        return Err(Flow::Err);
    };
    let v = record.value.clone();
    interp.set_result(v);
    Ok(())
}

fn cmd_setref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "reference newValue"));
    }
    let id = refs::get_reference_id(interp, &argv[1])?;
    if let Some(record) = interp.references.get_mut(&id) {
        record.value = argv[2].clone();
    }
    interp.set_result(argv[1].clone());
    Ok(())
}

fn cmd_collect(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(1, argv, ""));
    }
    let n = refs::collect(interp) as i64;
    let v = interp.heap().int(n);
    interp.set_result(v);
    Ok(())
}

// ----- introspection and host services -------------------------------------

fn cmd_info(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "option ?args ...?"));
    }
    if argv[1].eq_immediate("commands") {
        if argv.len() != 2 && argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "?pattern?"));
        }
        let pattern = argv.get(2).map(|p| p.as_str());
        let mut names = Vec::new();
        for name in interp.command_names() {
            if let Some(pat) = &pattern
                && !glob_match(pat.as_bytes(), name.as_bytes(), false)
            {
                continue;
            }
            let v = interp.heap().str(name);
            names.push(v);
        }
        let v = interp.heap().list(names);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("level") {
        if argv.len() != 2 && argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "?levelNum?"));
        }
        if argv.len() == 2 {
            let levels = interp.num_levels as i64;
            let v = interp.heap().int(levels);
            interp.set_result(v);
            return Ok(());
        }
        let level = argv[2].clone();
        let v = interp.info_level(&level)?;
        interp.set_result(v);
        Ok(())
    } else {
        let msg = format!(
            "bad option \"{}\": must be commands, level",
            argv[1].as_str()
        );
        Err(interp.error(msg))
    }
}

fn cmd_debug(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(1, argv, "option ?...?"));
    }
    if argv[1].eq_immediate("refcount") {
        if argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "object"));
        }
        let count = argv[2].handle_count() as i64;
        let v = interp.heap().int(count);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("objcount") {
        if argv.len() != 2 {
            return Err(interp.wrong_num_args(2, argv, ""));
        }
        let (used, free) = interp.heap().live_counts();
        interp.set_result_string(format!("free {free} used {used}"));
        Ok(())
    } else if argv[1].eq_immediate("objects") {
        let live = interp.heap().live_values();
        let mut rows = Vec::new();
        for value in live {
            let ty = interp.heap().str(value.type_name());
            let count = interp.heap().int(value.handle_count() as i64);
            let row = interp.heap().list(vec![ty, count, value]);
            rows.push(row);
        }
        let v = interp.heap().list(rows);
        interp.set_result(v);
        Ok(())
    } else if argv[1].eq_immediate("invstr") {
        if argv.len() != 3 {
            return Err(interp.wrong_num_args(2, argv, "object"));
        }
        let regenerable = matches!(
            &*argv[2].rep(),
            Rep::Str { .. }
                | Rep::Int(_)
                | Rep::Double(_)
                | Rep::List(_)
                | Rep::Dict(_)
                | Rep::Index(_)
                | Rep::Retcode(_)
                | Rep::Reference(_)
        );
        if regenerable {
            argv[2].invalidate_string();
        }
        interp.set_empty_result();
        Ok(())
    } else {
        Err(interp.error(
            "bad option. Valid options are refcount, objcount, objects, invstr",
        ))
    }
}

fn cmd_puts(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "-nonewline string"));
    }
    let mut nonewline = false;
    let mut text_idx = 1;
    if argv.len() == 3 {
        if !argv[1].eq_immediate("-nonewline") {
            interp.set_result_string("The second argument must be -nonewline");
            return Ok(());
        }
        nonewline = true;
        text_idx = 2;
    }
    let s = argv[text_idx].as_str();
    if nonewline {
        print!("{s}");
    } else {
        println!("{s}");
    }
    Ok(())
}

fn cmd_time(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(1, argv, "script ?count?"));
    }
    let count = if argv.len() == 3 {
        interp.wide_of(&argv[2])?
    } else {
        1
    };
    if count < 0 {
        return Ok(());
    }
    let start = std::time::Instant::now();
    for _ in 0..count {
        interp.eval_value(&argv[1])?;
    }
    let elapsed = start.elapsed().as_micros() as i64;
    let per_iteration = if count > 0 { elapsed / count } else { 0 };
    interp.set_result_string(format!("{per_iteration} microseconds per iteration"));
    Ok(())
}

fn cmd_exit(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() > 2 {
        return Err(interp.wrong_num_args(1, argv, "?exitCode?"));
    }
    let code = if argv.len() == 2 {
        interp.wide_of(&argv[1])?
    } else {
        0
    };
    std::process::exit(code as i32);
}

// ----- registration --------------------------------------------------------

type StaticCmd = fn(&mut Interp, &[Value]) -> CmdResult;

/// Name, handler, arity bounds (-1 = unbounded).
const CORE_COMMANDS: &[(&str, StaticCmd, i32, i32)] = &[
    ("set", cmd_set, 2, 3),
    ("unset", cmd_unset, 2, -1),
    ("puts", cmd_puts, 2, 3),
    ("+", cmd_add, 1, -1),
    ("*", cmd_mul, 1, -1),
    ("-", cmd_sub, 2, -1),
    ("/", cmd_div, 2, -1),
    ("incr", cmd_incr, 2, 3),
    ("while", cmd_while, 3, 3),
    ("for", cmd_for, 5, 5),
    ("foreach", cmd_foreach, 4, 4),
    ("if", cmd_if, 3, -1),
    ("list", cmd_list, 1, -1),
    ("lindex", cmd_lindex, 3, -1),
    ("lset", cmd_lset, 4, -1),
    ("llength", cmd_llength, 2, 2),
    ("lappend", cmd_lappend, 2, -1),
    ("append", cmd_append, 2, -1),
    ("debug", cmd_debug, 2, -1),
    ("eval", cmd_eval, 2, -1),
    ("uplevel", cmd_uplevel, 2, -1),
    ("expr", cmd_expr, 2, -1),
    ("break", cmd_break, 1, 1),
    ("continue", cmd_continue, 1, 1),
    ("proc", cmd_proc, 4, 4),
    ("concat", cmd_concat, 1, -1),
    ("return", cmd_return, 1, 4),
    ("upvar", cmd_upvar, 3, -1),
    ("global", cmd_global, 2, -1),
    ("string", cmd_string, 3, -1),
    ("time", cmd_time, 2, 3),
    ("exit", cmd_exit, 1, 2),
    ("catch", cmd_catch, 2, 3),
    ("ref", cmd_ref, 2, 3),
    ("getref", cmd_getref, 2, 2),
    ("setref", cmd_setref, 3, 3),
    ("collect", cmd_collect, 1, 1),
    ("rename", cmd_rename, 3, 3),
    ("dict", cmd_dict, 2, -1),
    ("array", cmd_array, 2, -1),
    ("subst", cmd_subst, 2, -1),
    ("info", cmd_info, 2, -1),
];

/// Anonymous procedures: a reference token doubles as a procedure name, and
/// the finalizer unregisters the procedure when the token is collected.
const CORE_PROCEDURES: &str = "proc lambda {arglist body} {
    set name [ref {} lambdaFinalizer]
    proc $name $arglist $body
    return $name
}
proc lambdaFinalizer {name val} {
    rename $name {}
}
";

pub(crate) fn register_core(interp: &mut Interp) {
    for &(name, func, arity_min, arity_max) in CORE_COMMANDS {
        let f: Rc<NativeFn> = Rc::new(func);
        interp.create_command(name, f, arity_min, arity_max);
    }
    let _ = interp.eval(CORE_PROCEDURES);
}
