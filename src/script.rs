//! Compiled scripts. A script's internal representation is the full token
//! stream produced by the parser plus a command layout array that tells the
//! evaluator, without re-scanning, how many arguments each command has and
//! how many tokens make up each argument.
//!
//! The layout is a flat integer array. For each command: an optional `-1`
//! flag when some argument carries the `{expand}` prefix, the argument
//! count, then one token count per argument (negated when that argument is
//! `{expand}`-prefixed). Separator and end-of-line tokens are not counted;
//! the evaluator walks the token array in lockstep with the layout.
//!
//! For the script
//!
//! ```text
//! puts hello
//! set $i $x$y [foo]BAR
//! ```
//!
//! the token stream is `ESC SEP ESC EOL ESC SEP VAR SEP VAR VAR SEP CMD ESC
//! EOL` and the layout is `2 1 1 4 1 1 2 2`.
//!
//! The same structure, built by the subst dialect of the parser, backs the
//! `subst` command; there the layout stays empty and the parse flags are
//! recorded so a request with different flags rebuilds it.

use std::collections::HashMap;
use std::rc::Rc;

use string_interner::DefaultSymbol;

use crate::parser::{Parser, TokenKind};
use crate::value::{Heap, Value};

pub(crate) struct ScriptToken {
    pub kind: TokenKind,
    pub value: Value,
    pub line: u32,
}

pub struct ScriptRep {
    pub(crate) tokens: Vec<ScriptToken>,
    pub(crate) layout: Vec<i32>,
    pub(crate) file: DefaultSymbol,
    pub(crate) subst_flags: u32,
}

/// Append a token, collapsing the noise the evaluator never wants to see:
/// runs of separators, separators directly before an end of line, and empty
/// escape tokens left over from word interpolation.
fn add_token(
    heap: &mut Heap,
    tokens: &mut Vec<ScriptToken>,
    text: String,
    kind: TokenKind,
    line: u32,
    source: Option<DefaultSymbol>,
) {
    let prev = tokens.last().map(|t| t.kind).unwrap_or(TokenKind::Eol);
    if prev == TokenKind::Eol {
        if kind == TokenKind::Eol || kind == TokenKind::Sep {
            return;
        }
    } else if prev == TokenKind::Sep {
        if kind == TokenKind::Sep {
            return;
        }
        if kind == TokenKind::Eol {
            tokens.pop();
        }
    } else if kind == TokenKind::Esc && text.is_empty() {
        return;
    }
    let value = heap.str(text);
    if let Some(file) = source
        && kind != TokenKind::Sep
        && kind != TokenKind::Eol
    {
        value.set_source(file, line);
    }
    tokens.push(ScriptToken { kind, value, line });
}

/// Literal word that requests list expansion of the rest of its word.
const EXPAND_WORD: &str = "expand";

fn is_expand_token(tok: &ScriptToken) -> bool {
    tok.kind == TokenKind::Str && &*tok.value.as_str() == EXPAND_WORD
}

/// Compute the command layout for a finished token stream.
fn build_layout(tokens: &[ScriptToken]) -> Vec<i32> {
    let mut layout = Vec::new();
    let mut end: i64 = -1;
    loop {
        let start = (end + 1) as usize;
        if start >= tokens.len() {
            break;
        }
        // Find the end of the command, counting arguments and looking for
        // the expand prefix on the way.
        let mut expand = false;
        let mut args = 1i32;
        let mut e = start;
        while tokens[e].kind != TokenKind::Eol {
            let word_start =
                e == 0 || matches!(tokens[e - 1].kind, TokenKind::Sep | TokenKind::Eol);
            if word_start
                && is_expand_token(&tokens[e])
                && tokens
                    .get(e + 1)
                    .is_some_and(|t| t.kind != TokenKind::Sep && t.kind != TokenKind::Eol)
            {
                expand = true;
            }
            if tokens[e].kind == TokenKind::Sep {
                args += 1;
            }
            e += 1;
        }
        if expand {
            layout.push(-1);
        }
        layout.push(args);
        // Token counts per argument, negated for expand-prefixed ones.
        let mut ntok = 0i32;
        let mut exp = false;
        for tok in &tokens[start..=e] {
            if matches!(tok.kind, TokenKind::Sep | TokenKind::Eol) {
                if ntok == 1 && exp {
                    // A lone "expand" word is just the word.
                    exp = false;
                }
                layout.push(if exp { -ntok } else { ntok });
                exp = false;
                ntok = 0;
                continue;
            }
            if ntok == 0 && is_expand_token(tok) {
                exp = true;
            }
            ntok += 1;
        }
        end = e as i64;
    }
    layout
}

/// Unify byte-identical token values so repeated literals in one script
/// share a single cell.
fn share_literals(tokens: &mut [ScriptToken]) {
    let mut seen: HashMap<String, Value> = HashMap::new();
    for tok in tokens.iter_mut() {
        let key = tok.value.as_str().to_string();
        match seen.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => {
                tok.value = e.get().clone();
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(tok.value.clone());
            }
        }
    }
}

/// Find a token in `script` (or any script nested in its token values) with
/// the same byte content as `v`, for literal sharing.
pub(crate) fn search_literal(script: &ScriptRep, v: &Value) -> Option<Value> {
    for tok in &script.tokens {
        if !tok.value.same(v) && tok.value.eq_bytes(v) {
            return Some(tok.value.clone());
        }
        if let Some(sub) = tok.value.script_rep()
            && let Some(found) = search_literal(&sub, v)
        {
            return Some(found);
        }
    }
    None
}

/// Parse script text into its compiled representation. When `source` is
/// given the script came from a file: its tokens are tagged with file/line
/// provenance and its literals unified.
pub(crate) fn compile_script(
    heap: &mut Heap,
    text: &str,
    source: Option<(DefaultSymbol, u32)>,
) -> ScriptRep {
    let (file, first_line, propagate) = match source {
        Some((file, line)) => (file, line, true),
        None => (heap.intern("?"), 1, false),
    };
    let mut tokens = Vec::new();
    let mut parser = Parser::new(text, first_line);
    while !parser.eof() {
        parser.parse_script_token();
        let (tok, kind, line) = parser.token();
        add_token(
            heap,
            &mut tokens,
            tok,
            kind,
            line,
            propagate.then_some(file),
        );
    }
    let layout = build_layout(&tokens);
    if propagate {
        share_literals(&mut tokens);
    }
    ScriptRep {
        tokens,
        layout,
        file,
        subst_flags: 0,
    }
}

/// Compiled representation of `v` as a script, building and caching it on
/// first use. The returned handle keeps the program alive even if `v`
/// shimmers away from it mid-evaluation.
pub(crate) fn script_of(heap: &mut Heap, v: &Value) -> Rc<ScriptRep> {
    if let Some(rep) = v.script_rep() {
        return rep;
    }
    let source = v.source_info();
    let text = v.as_str();
    let rep = Rc::new(compile_script(heap, &text, source));
    v.set_rep(crate::value::Rep::Script(Rc::clone(&rep)));
    rep
}

/// Parse substitution text: same structure as a script, no layout, and the
/// parse flags recorded for cache validation.
fn compile_subst(heap: &mut Heap, text: &str, flags: u32) -> ScriptRep {
    let file = heap.intern("?");
    let mut tokens = Vec::new();
    let mut parser = Parser::new(text, 1);
    while !parser.eof() {
        parser.parse_subst_token(flags);
        let (tok, kind, line) = parser.token();
        add_token(heap, &mut tokens, tok, kind, line, None);
    }
    ScriptRep {
        tokens,
        layout: Vec::new(),
        file,
        subst_flags: flags,
    }
}

/// Compiled substitution representation of `v` for the given flags,
/// rebuilding when the cached one was parsed with different flags.
pub(crate) fn subst_of(heap: &mut Heap, v: &Value, flags: u32) -> Rc<ScriptRep> {
    if let Some(rep) = v.subst_rep(flags) {
        return rep;
    }
    let text = v.as_str();
    let rep = Rc::new(compile_subst(heap, &text, flags));
    v.set_rep(crate::value::Rep::Subst(Rc::clone(&rep)));
    rep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(text: &str) -> ScriptRep {
        let mut heap = Heap::new();
        compile_script(&mut heap, text, Option::None)
    }

    fn kinds(rep: &ScriptRep) -> Vec<TokenKind> {
        rep.tokens.iter().map(|t| t.kind).collect()
    }

    use TokenKind::*;

    #[test]
    fn test_token_stream_and_layout() {
        let rep = compile("puts hello\nset $i $x$y [foo]BAR\n");
        assert_eq!(
            kinds(&rep),
            vec![
                Esc, Sep, Esc, Eol, Esc, Sep, Var, Sep, Var, Var, Sep, Cmd, Esc, Eol,
            ]
        );
        assert_eq!(rep.layout, vec![2, 1, 1, 4, 1, 1, 2, 2]);
    }

    #[test]
    fn test_layout_counts_per_command() {
        // (script, expected layout)
        let cases = vec![
            ("puts hello", vec![2, 1, 1]),
            ("a", vec![1, 1]),
            ("a b; c", vec![2, 1, 1, 1, 1]),
            ("a $x[b]c", vec![2, 1, 3]),
            ("", vec![]),
            ("   \n  ", vec![]),
            // Comments disappear entirely.
            ("# nothing here\nputs x", vec![2, 1, 1]),
        ];
        for (i, (src, want)) in cases.iter().enumerate() {
            let rep = compile(src);
            assert_eq!(&rep.layout, want, "layout case #{} for {:?}", i + 1, src);
        }
    }

    #[test]
    fn test_expand_layout() {
        // The {expand} prefix flags the command and negates the count.
        let rep = compile("list {expand}{1 2}");
        assert_eq!(rep.layout, vec![-1, 2, 1, -2]);
        // A lone "expand" word is an ordinary argument.
        let rep = compile("list {expand} x");
        assert_eq!(rep.layout, vec![3, 1, 1, 1]);
    }

    #[test]
    fn test_separator_collapse() {
        let rep = compile("a    b\n\n\nc  \nd");
        assert_eq!(
            kinds(&rep),
            vec![Esc, Sep, Esc, Eol, Esc, Eol, Esc, Eol]
        );
    }

    #[test]
    fn test_reparse_preserves_structure() {
        // Regenerating a parsed script from its tokens is not defined, but
        // parsing the same text twice must agree; and every non-separator
        // token's text must reproduce the original word content.
        let src = "set a {b c}\nputs \"x $a\"\nlappend a [llength $a]";
        let one = compile(src);
        let two = compile(src);
        assert_eq!(one.layout, two.layout);
        assert_eq!(kinds(&one), kinds(&two));
        let texts: Vec<String> = one
            .tokens
            .iter()
            .map(|t| t.value.as_str().to_string())
            .collect();
        let texts2: Vec<String> = two
            .tokens
            .iter()
            .map(|t| t.value.as_str().to_string())
            .collect();
        assert_eq!(texts, texts2);
    }

    #[test]
    fn test_source_tagging_and_literal_sharing() {
        let mut heap = Heap::new();
        let file = heap.intern("demo.tcl");
        let rep = compile_script(&mut heap, "set x 1\nset y 1\n", Some((file, 1)));
        // Word tokens carry provenance; separators do not.
        let set_tok = &rep.tokens[0];
        assert_eq!(set_tok.value.type_name(), "source");
        // The two "set" literals (and the two "1" literals) are unified.
        let sets: Vec<&ScriptToken> = rep
            .tokens
            .iter()
            .filter(|t| &*t.value.as_str() == "set")
            .collect();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].value.same(&sets[1].value));
        // Line numbers survive the unification on the token itself.
        assert_eq!(rep.tokens[0].line, 1);
        assert!(rep.tokens.iter().any(|t| t.line == 2));
    }

    #[test]
    fn test_script_of_caches_and_pins() {
        let mut heap = Heap::new();
        let v = heap.str("puts hi");
        let first = script_of(&mut heap, &v);
        let second = script_of(&mut heap, &v);
        assert!(Rc::ptr_eq(&first, &second));
        // Shimmering the value away does not free the borrowed program.
        v.set_rep(crate::value::Rep::None);
        assert_eq!(first.layout, vec![2, 1, 1]);
    }

    #[test]
    fn test_subst_rep_rebuilds_on_flag_change() {
        let mut heap = Heap::new();
        let v = heap.str("a $b [c]");
        let full = subst_of(&mut heap, &v, 0);
        assert_eq!(full.subst_flags, 0);
        let nocmd = subst_of(&mut heap, &v, crate::parser::SUBST_NOCMD);
        assert_ne!(full.subst_flags, nocmd.subst_flags);
        // The command token became literal text under NOCMD.
        assert!(nocmd.tokens.iter().all(|t| t.kind != Cmd));
        assert!(full.tokens.iter().any(|t| t.kind == Cmd));
    }

    #[test]
    fn test_search_literal() {
        let mut heap = Heap::new();
        let file = heap.intern("demo.tcl");
        let rep = compile_script(&mut heap, "set alpha 42\n", Some((file, 1)));
        let needle = heap.str("alpha");
        let found = search_literal(&rep, &needle).expect("literal found");
        assert_eq!(&*found.as_str(), "alpha");
        assert!(!found.same(&needle));
        let missing = heap.str("beta");
        assert!(search_literal(&rep, &missing).is_none());
    }
}
