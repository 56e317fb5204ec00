//! tclet - a small embeddable command language interpreter
//!
//! This crate implements a Tcl-style scripting language: commands whose
//! arguments are produced by word splitting, brace quoting, variable
//! substitution (`$name`, `$name(key)`), command substitution (`[cmd ...]`)
//! and backslash escapes. Everything is a string; frequently used values
//! carry a cached internal representation (integer, list, dictionary,
//! compiled script, expression bytecode, ...) that is regenerated from the
//! string form on demand and discarded when the value is reinterpreted.
//!
//! ```
//! use tclet::interp::Interp;
//!
//! let mut interp = Interp::new();
//! interp.eval("set x [expr {6 * 7}]").unwrap();
//! assert_eq!(&*interp.result().as_str(), "42");
//! ```
//!
//! ## Modules
//!
//! - `value`: dual string/internal representation values and the heap
//! - `parser`: the byte-at-a-time tokenizer (script, list, subst and
//!   expression dialects)
//! - `script`: compiled script representations with a per-command layout
//! - `expr`: the expression compiler and its stack machine
//! - `interp`: interpreter state, callframes, variables, command dispatch
//! - `refs`: garbage-collected reference tokens
//! - `commands`: the core command set
//!
//! An interpreter is single threaded; independent interpreters never share
//! values, commands or references.

use std::fmt;

pub mod commands;
pub mod expr;
pub mod interp;
pub mod parser;
pub mod refs;
pub mod script;
pub mod value;

/// Maximum procedure-call nesting before evaluation is aborted with
/// "Too many nested calls".
pub const MAX_NESTING_DEPTH: usize = 10_000;

/// Fixed width, in bytes, of a reference token's string form:
/// `~reference:<20 digits>:`.
pub const REFERENCE_SPACE: usize = 32;

/// A collection is triggered once this many reference ids have been handed
/// out since the last one.
pub const COLLECT_ID_PERIOD: i64 = 5_000;

/// A collection is also triggered after this many seconds without one.
pub const COLLECT_TIME_PERIOD: u64 = 300;

/// Completion code of an evaluation. Every command finishes with one of
/// these; `Ok` is the normal case, everything else unwinds until a construct
/// absorbs it (`catch` for errors, loops for `Break`/`Continue`, the
/// procedure boundary for `Return`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retcode {
    Ok,
    Err,
    Return,
    Break,
    Continue,
}

impl Retcode {
    pub fn as_wide(self) -> i64 {
        match self {
            Retcode::Ok => 0,
            Retcode::Err => 1,
            Retcode::Return => 2,
            Retcode::Break => 3,
            Retcode::Continue => 4,
        }
    }

    pub fn from_wide(w: i64) -> Option<Retcode> {
        match w {
            0 => Some(Retcode::Ok),
            1 => Some(Retcode::Err),
            2 => Some(Retcode::Return),
            3 => Some(Retcode::Break),
            4 => Some(Retcode::Continue),
            _ => None,
        }
    }

    /// Symbolic name as used by `return -code`.
    pub fn name(self) -> &'static str {
        match self {
            Retcode::Ok => "ok",
            Retcode::Err => "error",
            Retcode::Return => "return",
            Retcode::Break => "break",
            Retcode::Continue => "continue",
        }
    }

    pub fn from_name(s: &str) -> Option<Retcode> {
        if s.eq_ignore_ascii_case("ok") {
            Some(Retcode::Ok)
        } else if s.eq_ignore_ascii_case("error") {
            Some(Retcode::Err)
        } else if s.eq_ignore_ascii_case("return") {
            Some(Retcode::Return)
        } else if s.eq_ignore_ascii_case("break") {
            Some(Retcode::Break)
        } else if s.eq_ignore_ascii_case("continue") {
            Some(Retcode::Continue)
        } else {
            None
        }
    }
}

impl fmt::Display for Retcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The non-`Ok` completion codes, used as the error side of command results
/// so that `?` propagates them. The message for `Flow::Err` travels in the
/// interpreter result value, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Err,
    Return,
    Break,
    Continue,
}

impl Flow {
    pub fn retcode(self) -> Retcode {
        match self {
            Flow::Err => Retcode::Err,
            Flow::Return => Retcode::Return,
            Flow::Break => Retcode::Break,
            Flow::Continue => Retcode::Continue,
        }
    }
}

/// Result type of every command implementation. The interpreter result value
/// carries the payload.
pub type CmdResult = Result<(), Flow>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retcode_round_trip() {
        let cases = [
            (Retcode::Ok, 0, "ok"),
            (Retcode::Err, 1, "error"),
            (Retcode::Return, 2, "return"),
            (Retcode::Break, 3, "break"),
            (Retcode::Continue, 4, "continue"),
        ];
        for (code, wide, name) in cases {
            assert_eq!(code.as_wide(), wide);
            assert_eq!(Retcode::from_wide(wide), Some(code));
            assert_eq!(code.name(), name);
            assert_eq!(Retcode::from_name(name), Some(code));
            assert_eq!(Retcode::from_name(&name.to_uppercase()), Some(code));
        }
        assert_eq!(Retcode::from_wide(5), None);
        assert_eq!(Retcode::from_name("fail"), None);
    }

    #[test]
    fn test_flow_maps_into_retcodes() {
        assert_eq!(Flow::Err.retcode(), Retcode::Err);
        assert_eq!(Flow::Return.retcode(), Retcode::Return);
        assert_eq!(Flow::Break.retcode(), Retcode::Break);
        assert_eq!(Flow::Continue.retcode(), Retcode::Continue);
    }
}
