//! Values and the heap. A [`Value`] is a cheap handle to a cell holding a
//! byte-string representation, an internal representation, or both. The
//! string form is the canonical one: any internal representation can be
//! regenerated from it, and converting a value to a different internal
//! representation ("shimmering") first materializes the string, then drops
//! the old representation.
//!
//! A value is *shared* once more than one handle points at it; shared values
//! are never mutated in place - mutators duplicate first. The [`Heap`] owns
//! value allocation, a registry of weak handles to every live cell (walked
//! by the reference collector) and the interpreter's shared-string pool.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::Retcode;
use crate::expr::ExprRep;
use crate::interp::{Cmd, Var};
use crate::parser::{Parser, TokenKind};
use crate::refs::format_reference;
use crate::script::ScriptRep;

/// Internal representation of a value. `None` is a plain string.
pub(crate) enum Rep {
    None,
    /// String with an append buffer; the buffer's spare capacity is the
    /// amortized-doubling allowance.
    Str { buf: String },
    Int(i64),
    Double(f64),
    List(Vec<Value>),
    Dict(HashMap<Value, Value>),
    Script(Rc<ScriptRep>),
    Subst(Rc<ScriptRep>),
    Expr(Rc<ExprRep>),
    /// Resolved list index; negative values count from the end (-1 is
    /// "end"), `i64::MAX` marks out-of-range.
    Index(i64),
    Retcode(Retcode),
    /// Cached affirmative comparison against a static literal.
    CmpStr(&'static str),
    /// A string whose provenance carries a file name and line.
    Source { file: DefaultSymbol, line: u32 },
    /// Cached variable resolution, valid while the frame id matches.
    Var { frame_id: u64, var: Weak<RefCell<Var>> },
    /// Cached command resolution, valid while the epoch matches.
    Command { epoch: u64, cmd: Rc<Cmd> },
    Reference(i64),
}

pub(crate) struct ValueCell {
    bytes: RefCell<Option<Rc<str>>>,
    rep: RefCell<Rep>,
}

/// The universal datum.
#[derive(Clone)]
pub struct Value {
    cell: Rc<ValueCell>,
}

impl Value {
    /// The canonical byte string, regenerating it from the internal
    /// representation when necessary.
    pub fn as_str(&self) -> Rc<str> {
        if let Some(b) = &*self.cell.bytes.borrow() {
            return Rc::clone(b);
        }
        let s = self.regenerate();
        let rc: Rc<str> = Rc::from(s.as_str());
        *self.cell.bytes.borrow_mut() = Some(Rc::clone(&rc));
        rc
    }

    fn regenerate(&self) -> String {
        match &*self.rep() {
            Rep::Str { buf } => buf.clone(),
            Rep::Int(w) => w.to_string(),
            Rep::Double(d) => fmt_double(*d),
            Rep::List(ele) => format_elements(ele),
            Rep::Dict(map) => {
                let flat: Vec<Value> = map
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), v.clone()])
                    .collect();
                format_elements(&flat)
            }
            Rep::Index(i) => fmt_index(*i),
            Rep::Retcode(rc) => rc.name().to_string(),
            Rep::Reference(id) => format_reference(*id),
            _ => panic!(
                "string representation requested for a bare {} value",
                self.type_name()
            ),
        }
    }

    /// Drop the byte string; the internal representation becomes the only
    /// description of the value. Mutators call this after changing it.
    pub fn invalidate_string(&self) {
        *self.cell.bytes.borrow_mut() = None;
    }

    pub(crate) fn has_string(&self) -> bool {
        self.cell.bytes.borrow().is_some()
    }

    /// Byte length of the canonical string.
    pub fn strlen(&self) -> usize {
        self.as_str().len()
    }

    /// A value is shared once more than one handle points at it. Shared
    /// values must not be mutated; duplicate them first.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.cell) > 1
    }

    /// Number of live handles to this value.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.cell)
    }

    /// True if both handles point at the very same cell.
    pub fn same(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn rep(&self) -> Ref<'_, Rep> {
        self.cell.rep.borrow()
    }

    pub(crate) fn rep_mut(&self) -> RefMut<'_, Rep> {
        self.cell.rep.borrow_mut()
    }

    /// Replace the internal representation. The previous one is gone for
    /// good; the byte string, if present, stays.
    pub(crate) fn set_rep(&self, rep: Rep) {
        *self.cell.rep.borrow_mut() = rep;
    }

    pub fn type_name(&self) -> &'static str {
        match &*self.rep() {
            Rep::None | Rep::Str { .. } => "string",
            Rep::Int(_) => "int",
            Rep::Double(_) => "double",
            Rep::List(_) => "list",
            Rep::Dict(_) => "dict",
            Rep::Script(_) => "script",
            Rep::Subst(_) => "subst",
            Rep::Expr(_) => "expression",
            Rep::Index(_) => "index",
            Rep::Retcode(_) => "return-code",
            Rep::CmpStr(_) => "compared-string",
            Rep::Source { .. } => "source",
            Rep::Var { .. } => "variable",
            Rep::Command { .. } => "command",
            Rep::Reference(_) => "reference",
        }
    }

    /// Whether the string form of this representation may embed reference
    /// tokens, making it relevant for the collector's scan. Container types
    /// are skipped: their elements are scanned individually.
    pub(crate) fn scannable_for_references(&self) -> bool {
        matches!(
            &*self.rep(),
            Rep::None
                | Rep::Str { .. }
                | Rep::CmpStr(_)
                | Rep::Source { .. }
                | Rep::Script(_)
                | Rep::Subst(_)
                | Rep::Expr(_)
                | Rep::Var { .. }
                | Rep::Command { .. }
        )
    }

    /// Byte equality of the canonical strings.
    pub fn eq_bytes(&self, other: &Value) -> bool {
        self.same(other) || self.as_str() == other.as_str()
    }

    /// Fast equality against a static literal. A hit caches the literal so
    /// the next comparison is a pointer check.
    pub fn eq_immediate(&self, lit: &'static str) -> bool {
        {
            if let Rep::CmpStr(p) = &*self.rep()
                && std::ptr::eq(*p, lit)
            {
                return true;
            }
        }
        if &*self.as_str() != lit {
            return false;
        }
        self.set_rep(Rep::CmpStr(lit));
        true
    }

    /// Deep copy. The copy starts unshared; list and dictionary elements are
    /// shared with the original until either side mutates.
    pub fn duplicate(&self, heap: &mut Heap) -> Value {
        let rep = match &*self.rep() {
            Rep::None => Rep::None,
            Rep::Str { buf } => Rep::Str { buf: buf.clone() },
            Rep::Int(w) => Rep::Int(*w),
            Rep::Double(d) => Rep::Double(*d),
            Rep::List(e) => Rep::List(e.clone()),
            Rep::Dict(m) => Rep::Dict(m.clone()),
            // Compiled programs are not copied; the duplicate falls back to
            // its string form and recompiles on demand.
            Rep::Script(_) | Rep::Subst(_) | Rep::Expr(_) => Rep::None,
            Rep::Index(i) => Rep::Index(*i),
            Rep::Retcode(rc) => Rep::Retcode(*rc),
            Rep::CmpStr(p) => Rep::CmpStr(*p),
            Rep::Source { file, line } => Rep::Source {
                file: *file,
                line: *line,
            },
            Rep::Var { frame_id, var } => Rep::Var {
                frame_id: *frame_id,
                var: var.clone(),
            },
            Rep::Command { epoch, cmd } => Rep::Command {
                epoch: *epoch,
                cmd: Rc::clone(cmd),
            },
            Rep::Reference(id) => Rep::Reference(*id),
        };
        let bytes = self.cell.bytes.borrow().clone();
        heap.alloc(bytes, rep)
    }

    // ----- numeric conversions -------------------------------------------

    /// 64-bit integer interpretation, caching it as the internal rep.
    pub fn get_wide(&self) -> Result<i64, String> {
        if let Rep::Int(w) = &*self.rep() {
            return Ok(*w);
        }
        let s = self.as_str();
        let w = match parse_wide(&s) {
            Ok(w) => w,
            Err(WideError::Range) => {
                return Err("Integer value too big to be represented".to_string());
            }
            Err(WideError::Format) => {
                return Err(format!("Expected integer but got '{s}'"));
            }
        };
        self.set_rep(Rep::Int(w));
        Ok(w)
    }

    /// Floating-point interpretation, caching it as the internal rep.
    pub fn get_double(&self) -> Result<f64, String> {
        if let Rep::Double(d) = &*self.rep() {
            return Ok(*d);
        }
        let s = self.as_str();
        let d: f64 = match s.trim_start().parse() {
            Ok(d) => d,
            Err(_) => return Err(format!("Expected number but got '{s}'")),
        };
        self.set_rep(Rep::Double(d));
        Ok(d)
    }

    /// A value that is only a double, with no string form to reinterpret.
    /// Such values force the floating-point path in the expression machine.
    pub(crate) fn is_pure_double(&self) -> bool {
        matches!(&*self.rep(), Rep::Double(_)) && !self.has_string()
    }

    /// Replace the value with an integer in place. Only for unshared values.
    pub(crate) fn set_wide(&self, w: i64) {
        self.set_rep(Rep::Int(w));
        self.invalidate_string();
    }

    /// List/string index interpretation: `N`, `end` or `end-N`.
    pub fn get_index(&self) -> Result<i64, String> {
        // An integer value is read directly, avoiding the shimmer.
        {
            match &*self.rep() {
                Rep::Int(w) => return Ok(if *w < 0 { i64::MAX } else { *w }),
                Rep::Index(i) => return Ok(*i),
                _ => {}
            }
        }
        let s = self.as_str();
        let bad = || format!("bad index \"{s}\": must be integer or end?-integer?");
        let idx = if &*s == "end" {
            -1
        } else if let Some(rest) = s.strip_prefix("end-") {
            let off = parse_wide(rest).map_err(|_| bad())?;
            if off < 0 { i64::MAX } else { -(off + 1) }
        } else {
            let v = parse_wide(&s).map_err(|_| bad())?;
            if v < 0 { i64::MAX } else { v }
        };
        self.set_rep(Rep::Index(idx));
        Ok(idx)
    }

    /// Return-code interpretation: a symbolic name or a numeric code.
    pub fn get_retcode(&self) -> Result<Retcode, String> {
        if let Rep::Retcode(rc) = &*self.rep() {
            return Ok(*rc);
        }
        let s = self.as_str();
        let rc = Retcode::from_name(&s)
            .or_else(|| parse_wide(&s).ok().and_then(Retcode::from_wide))
            .ok_or_else(|| format!("Expected return code but got '{s}'"))?;
        self.set_rep(Rep::Retcode(rc));
        Ok(rc)
    }

    // ----- source provenance ---------------------------------------------

    pub(crate) fn source_info(&self) -> Option<(DefaultSymbol, u32)> {
        if let Rep::Source { file, line } = &*self.rep() {
            Some((*file, *line))
        } else {
            None
        }
    }

    /// Tag a fresh string value with the file and line it was read from.
    pub(crate) fn set_source(&self, file: DefaultSymbol, line: u32) {
        if matches!(&*self.rep(), Rep::None) {
            self.set_rep(Rep::Source { file, line });
        }
    }

    // ----- compiled representations --------------------------------------

    pub(crate) fn script_rep(&self) -> Option<Rc<ScriptRep>> {
        if let Rep::Script(r) = &*self.rep() {
            Some(Rc::clone(r))
        } else {
            None
        }
    }

    pub(crate) fn subst_rep(&self, flags: u32) -> Option<Rc<ScriptRep>> {
        if let Rep::Subst(r) = &*self.rep()
            && r.subst_flags == flags
        {
            Some(Rc::clone(r))
        } else {
            None
        }
    }

    pub(crate) fn expr_rep(&self) -> Option<Rc<ExprRep>> {
        if let Rep::Expr(r) = &*self.rep() {
            Some(Rc::clone(r))
        } else {
            None
        }
    }

    // ----- string append -------------------------------------------------

    /// Append raw text, coercing the value to the string representation.
    /// Only for unshared values.
    pub(crate) fn append_str(&self, s: &str) {
        if !matches!(&*self.rep(), Rep::Str { .. }) {
            let cur = self.as_str();
            self.set_rep(Rep::Str {
                buf: cur.to_string(),
            });
        }
        if let Rep::Str { buf } = &mut *self.rep_mut() {
            buf.push_str(s);
        }
        self.invalidate_string();
    }

    pub(crate) fn append_value(&self, other: &Value) {
        let s = other.as_str();
        self.append_str(&s);
    }

    // ----- list interpretation -------------------------------------------

    /// Reinterpret as a list. The string-to-list conversion cannot fail.
    pub(crate) fn ensure_list(&self, heap: &mut Heap) {
        if matches!(&*self.rep(), Rep::List(_)) {
            return;
        }
        let s = self.as_str();
        let ele = parse_list_elements(heap, &s);
        self.set_rep(Rep::List(ele));
    }

    pub fn list_len(&self, heap: &mut Heap) -> usize {
        self.ensure_list(heap);
        match &*self.rep() {
            Rep::List(e) => e.len(),
            _ => 0,
        }
    }

    pub fn list_elements(&self, heap: &mut Heap) -> Vec<Value> {
        self.ensure_list(heap);
        match &*self.rep() {
            Rep::List(e) => e.clone(),
            _ => Vec::new(),
        }
    }

    /// Element at `index`; negative indexes count from the end. `None` when
    /// out of range.
    pub fn list_index(&self, heap: &mut Heap, index: i64) -> Option<Value> {
        self.ensure_list(heap);
        match &*self.rep() {
            Rep::List(e) => {
                let len = e.len() as i64;
                if (index >= 0 && index >= len) || (index < 0 && (-index - 1) >= len) {
                    return None;
                }
                let idx = if index < 0 { len + index } else { index };
                Some(e[idx as usize].clone())
            }
            _ => None,
        }
    }

    /// Element at `index`, duplicated in place first if it is shared, so the
    /// caller may mutate it.
    pub(crate) fn list_index_for_write(&self, heap: &mut Heap, index: i64) -> Option<Value> {
        self.ensure_list(heap);
        let mut r = self.rep_mut();
        let Rep::List(e) = &mut *r else {
            return None;
        };
        let len = e.len() as i64;
        if (index >= 0 && index >= len) || (index < 0 && (-index - 1) >= len) {
            return None;
        }
        let idx = (if index < 0 { len + index } else { index }) as usize;
        if e[idx].handle_count() > 1 {
            let dup = e[idx].duplicate(heap);
            e[idx] = dup.clone();
            Some(dup)
        } else {
            Some(e[idx].clone())
        }
    }

    /// Replace the element at `index`. Only for unshared values. False when
    /// out of range.
    pub(crate) fn list_set_index(&self, heap: &mut Heap, index: i64, v: Value) -> bool {
        self.ensure_list(heap);
        let mut r = self.rep_mut();
        let Rep::List(e) = &mut *r else {
            return false;
        };
        let len = e.len() as i64;
        if (index >= 0 && index >= len) || (index < 0 && (-index - 1) >= len) {
            return false;
        }
        let idx = (if index < 0 { len + index } else { index }) as usize;
        e[idx] = v;
        true
    }

    /// Append an element. Only for unshared values.
    pub fn list_push(&self, heap: &mut Heap, v: Value) {
        self.ensure_list(heap);
        self.invalidate_string();
        if let Rep::List(e) = &mut *self.rep_mut() {
            e.push(v);
        }
    }

    // ----- dictionary interpretation -------------------------------------

    /// Reinterpret as a dictionary. Fails on an odd number of elements.
    pub(crate) fn ensure_dict(&self, heap: &mut Heap) -> Result<(), String> {
        if matches!(&*self.rep(), Rep::Dict(_)) {
            return Ok(());
        }
        let s = self.as_str();
        let ele = parse_list_elements(heap, &s);
        if ele.len() % 2 != 0 {
            return Err("missing value to go with key".to_string());
        }
        let mut map = HashMap::with_capacity(ele.len() / 2);
        for pair in ele.chunks_exact(2) {
            map.insert(pair[0].clone(), pair[1].clone());
        }
        self.set_rep(Rep::Dict(map));
        Ok(())
    }

    pub fn dict_get(&self, heap: &mut Heap, key: &Value) -> Result<Option<Value>, String> {
        self.ensure_dict(heap)?;
        match &*self.rep() {
            Rep::Dict(m) => Ok(m.get(key).cloned()),
            _ => Ok(None),
        }
    }

    /// Insert (or, with `None`, remove) a key. Only for unshared values.
    pub fn dict_set(&self, heap: &mut Heap, key: &Value, val: Option<Value>) -> Result<(), String> {
        self.ensure_dict(heap)?;
        {
            let mut r = self.rep_mut();
            if let Rep::Dict(m) = &mut *r {
                match val {
                    Some(v) => {
                        m.insert(key.clone(), v);
                    }
                    None => {
                        m.remove(key);
                    }
                }
            }
        }
        self.invalidate_string();
        Ok(())
    }

    /// Value stored under `key`, duplicated in place first if shared.
    pub(crate) fn dict_entry_for_write(
        &self,
        heap: &mut Heap,
        key: &Value,
    ) -> Result<Option<Value>, String> {
        self.ensure_dict(heap)?;
        let mut r = self.rep_mut();
        let Rep::Dict(m) = &mut *r else {
            return Ok(None);
        };
        let Some(cur) = m.get(key) else {
            return Ok(None);
        };
        if cur.handle_count() > 1 {
            let dup = cur.duplicate(heap);
            m.insert(key.clone(), dup.clone());
            Ok(Some(dup))
        } else {
            Ok(Some(cur.clone()))
        }
    }

    pub fn dict_pairs(&self, heap: &mut Heap) -> Result<Vec<(Value, Value)>, String> {
        self.ensure_dict(heap)?;
        match &*self.rep() {
            Rep::Dict(m) => Ok(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Ok(Vec::new()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_bytes(other)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(self.as_str().as_bytes());
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", &*self.as_str())
    }
}

/// Per-interpreter value allocator: tracks every live cell through weak
/// handles (the collector walks them) and owns the shared-string pool used
/// for file names.
pub struct Heap {
    live: Vec<Weak<ValueCell>>,
    prune_at: usize,
    pool: DefaultStringInterner,
}

impl Heap {
    pub(crate) fn new() -> Heap {
        Heap {
            live: Vec::new(),
            prune_at: 1024,
            pool: DefaultStringInterner::new(),
        }
    }

    pub(crate) fn alloc(&mut self, bytes: Option<Rc<str>>, rep: Rep) -> Value {
        let cell = Rc::new(ValueCell {
            bytes: RefCell::new(bytes),
            rep: RefCell::new(rep),
        });
        self.live.push(Rc::downgrade(&cell));
        if self.live.len() >= self.prune_at {
            self.prune();
        }
        Value { cell }
    }

    fn prune(&mut self) {
        let before = self.live.len();
        self.live.retain(|w| w.strong_count() > 0);
        self.prune_at = (self.live.len() * 2).max(1024);
        log::debug!(
            "value registry pruned: {} -> {} entries",
            before,
            self.live.len()
        );
    }

    /// New string value.
    pub fn str(&mut self, s: impl Into<String>) -> Value {
        let s: String = s.into();
        self.alloc(Some(Rc::from(s.as_str())), Rep::None)
    }

    /// New empty string value.
    pub fn empty(&mut self) -> Value {
        self.str("")
    }

    pub fn int(&mut self, w: i64) -> Value {
        self.alloc(None, Rep::Int(w))
    }

    pub fn double(&mut self, d: f64) -> Value {
        self.alloc(None, Rep::Double(d))
    }

    pub fn list(&mut self, elements: Vec<Value>) -> Value {
        self.alloc(None, Rep::List(elements))
    }

    /// New dictionary from a flat key/value slice. The slice length must be
    /// even.
    pub fn dict(&mut self, pairs: &[Value]) -> Value {
        let mut map = HashMap::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks_exact(2) {
            map.insert(pair[0].clone(), pair[1].clone());
        }
        self.alloc(None, Rep::Dict(map))
    }

    /// Upgradeable snapshot of every live value. Dead registry entries are
    /// dropped on the way.
    pub(crate) fn live_values(&mut self) -> Vec<Value> {
        self.live.retain(|w| w.strong_count() > 0);
        self.live
            .iter()
            .filter_map(Weak::upgrade)
            .map(|cell| Value { cell })
            .collect()
    }

    /// `(live, stale)` entry counts of the registry.
    pub(crate) fn live_counts(&self) -> (usize, usize) {
        let alive = self.live.iter().filter(|w| w.strong_count() > 0).count();
        (alive, self.live.len() - alive)
    }

    pub(crate) fn intern(&mut self, s: &str) -> DefaultSymbol {
        self.pool.get_or_intern(s)
    }

    pub(crate) fn resolve(&self, sym: DefaultSymbol) -> &str {
        self.pool.resolve(sym).unwrap_or("?")
    }
}

// ----- number formatting and parsing -------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum WideError {
    Format,
    Range,
}

/// Parse a 64-bit integer with base detection: `0x` prefix for hex, a
/// leading zero for octal, decimal otherwise. Leading whitespace is skipped;
/// trailing characters are a format error.
pub(crate) fn parse_wide(s: &str) -> Result<i64, WideError> {
    let t = s.trim_start();
    let b = t.as_bytes();
    let mut i = 0;
    let mut neg = false;
    match b.first() {
        Some(b'-') => {
            neg = true;
            i = 1;
        }
        Some(b'+') => i = 1,
        _ => {}
    }
    let (base, start) = if b.len() >= i + 2 && b[i] == b'0' && (b[i + 1] | 0x20) == b'x' {
        (16u32, i + 2)
    } else if b.len() > i + 1 && b[i] == b'0' {
        (8u32, i + 1)
    } else {
        (10u32, i)
    };
    let digits = &b[start.min(b.len())..];
    if digits.is_empty() {
        return Err(WideError::Format);
    }
    // Accumulate on the negative side so i64::MIN parses.
    let mut acc: i64 = 0;
    for &c in digits {
        let d = (c as char).to_digit(base).ok_or(WideError::Format)?;
        acc = acc
            .checked_mul(base as i64)
            .and_then(|a| a.checked_sub(d as i64))
            .ok_or(WideError::Range)?;
    }
    if neg {
        Ok(acc)
    } else {
        acc.checked_neg().ok_or(WideError::Range)
    }
}

/// Canonical string form of a double: always carries a decimal point, an
/// exponent or a non-finite name, so it cannot be mistaken for an integer.
pub(crate) fn fmt_double(d: f64) -> String {
    let mut s = format!("{d}");
    if !s.contains(['.', 'e', 'E']) && !s.contains("inf") && !s.contains("NaN") {
        s.push_str(".0");
    }
    s
}

fn fmt_index(i: i64) -> String {
    if i >= 0 {
        i.to_string()
    } else if i == -1 {
        "end".to_string()
    } else {
        format!("end{}", i + 1)
    }
}

// ----- list formatting ----------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Quoting {
    Simple,
    Brace,
    Quote,
}

fn is_list_special(c: char) -> bool {
    matches!(
        c,
        ' ' | '$' | '"' | '[' | ']' | ';' | '\\' | '\r' | '\n' | '\t' | '\x0c' | '\x0b'
    )
}

/// Decide how a string must be written to survive as one list element:
/// bare, brace-wrapped or backslash-quoted.
fn element_quoting(s: &str) -> Quoting {
    if s.is_empty() {
        return Quoting::Brace;
    }
    let mut try_simple = true;
    let mut needs_test = false;
    if s.starts_with('"') || s.starts_with('{') {
        try_simple = false;
        needs_test = true;
    } else {
        for c in s.chars() {
            if is_list_special(c) {
                try_simple = false;
                needs_test = true;
                break;
            }
            if c == '{' || c == '}' {
                needs_test = true;
                break;
            }
        }
    }
    if !needs_test {
        return Quoting::Simple;
    }
    // Braces only work when they balance and nothing escapes past them.
    if s.ends_with('\\') || s.ends_with(']') {
        return Quoting::Quote;
    }
    let chars: Vec<char> = s.chars().collect();
    let mut level = 0i32;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' => level += 1,
            '}' => {
                level -= 1;
                if level < 0 {
                    return Quoting::Quote;
                }
            }
            '\\' => {
                if chars.get(i + 1) == Some(&'\n') {
                    return Quoting::Quote;
                }
                if i + 1 < chars.len() {
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if level != 0 {
        return Quoting::Quote;
    }
    if !try_simple {
        return Quoting::Brace;
    }
    if s.chars().any(is_list_special) {
        Quoting::Brace
    } else {
        Quoting::Simple
    }
}

fn backslash_quote(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            ' ' | '$' | '"' | '[' | ']' | '{' | '}' | ';' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0c' => out.push_str("\\f"),
            '\x0b' => out.push_str("\\v"),
            _ => out.push(c),
        }
    }
}

/// Canonical string form of a sequence of elements: parsing it back yields
/// the same elements byte for byte.
pub(crate) fn format_elements(elements: &[Value]) -> String {
    let mut out = String::new();
    for (i, ele) in elements.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let s = ele.as_str();
        match element_quoting(&s) {
            Quoting::Simple => out.push_str(&s),
            Quoting::Brace => {
                out.push('{');
                out.push_str(&s);
                out.push('}');
            }
            Quoting::Quote => backslash_quote(&s, &mut out),
        }
    }
    out
}

/// Split list text into element values using the list dialect of the parser.
pub(crate) fn parse_list_elements(heap: &mut Heap, text: &str) -> Vec<Value> {
    let mut p = Parser::new(text, 1);
    let mut out = Vec::new();
    while !p.eof() {
        p.parse_list_token();
        if matches!(p.token_kind(), TokenKind::Str | TokenKind::Esc) {
            let (tok, _, _) = p.token();
            out.push(heap.str(tok));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wide() {
        let ok = vec![
            ("0", 0),
            ("42", 42),
            ("-5", -5),
            ("+7", 7),
            ("  12", 12),
            ("0x1A", 26),
            ("0X1a", 26),
            ("010", 8),
            ("-010", -8),
            ("9223372036854775807", i64::MAX),
            ("-9223372036854775808", i64::MIN),
        ];
        for (i, (src, want)) in ok.iter().enumerate() {
            assert_eq!(parse_wide(src), Ok(*want), "case #{} for {:?}", i + 1, src);
        }
        let format = vec!["", " ", "abc", "1.5", "12 ", "0x", "08", "--3"];
        for src in format {
            assert_eq!(parse_wide(src), Err(WideError::Format), "{src:?}");
        }
        assert_eq!(
            parse_wide("9223372036854775808"),
            Err(WideError::Range)
        );
        assert_eq!(
            parse_wide("-9223372036854775809"),
            Err(WideError::Range)
        );
    }

    #[test]
    fn test_fmt_double_always_reparses_as_double() {
        let cases = vec![
            (1.5, "1.5"),
            (2.0, "2.0"),
            (-0.25, "-0.25"),
            (100.0, "100.0"),
        ];
        for (d, want) in cases {
            assert_eq!(fmt_double(d), want);
        }
        assert!(fmt_double(1e300).parse::<f64>().is_ok());
    }

    #[test]
    fn test_int_value_string_round_trip() {
        let mut heap = Heap::new();
        let v = heap.int(1234);
        assert_eq!(&*v.as_str(), "1234");
        assert_eq!(v.get_wide(), Ok(1234));
        let s = heap.str("0x10");
        assert_eq!(s.get_wide(), Ok(16));
        // The conversion shimmered the value; the string stays intact.
        assert_eq!(&*s.as_str(), "0x10");
        assert_eq!(s.type_name(), "int");
    }

    #[test]
    fn test_get_wide_errors() {
        let mut heap = Heap::new();
        let v = heap.str("pear");
        assert_eq!(
            v.get_wide().unwrap_err(),
            "Expected integer but got 'pear'"
        );
        let big = heap.str("99999999999999999999");
        assert_eq!(
            big.get_wide().unwrap_err(),
            "Integer value too big to be represented"
        );
    }

    #[test]
    fn test_duplicate_compares_byte_equal() {
        let mut heap = Heap::new();
        let samples = vec![
            heap.str("hello world"),
            heap.int(-7),
            heap.double(2.5),
        ];
        let l = {
            let a = heap.str("a");
            let b = heap.str("b c");
            heap.list(vec![a, b])
        };
        for v in samples.into_iter().chain([l]) {
            let dup = v.duplicate(&mut heap);
            assert!(!dup.same(&v));
            assert_eq!(dup.as_str(), v.as_str());
        }
    }

    #[test]
    fn test_shared_flag_follows_handles() {
        let mut heap = Heap::new();
        let v = heap.str("x");
        assert!(!v.is_shared());
        let w = v.clone();
        assert!(v.is_shared());
        drop(w);
        assert!(!v.is_shared());
    }

    #[test]
    fn test_list_round_trip() {
        let mut heap = Heap::new();
        let cases = vec![
            vec!["a", "b", "c"],
            vec!["one element"],
            vec!["", "x"],
            vec!["with \"quote", "and ] bracket"],
            vec!["{unbalanced", "ok"],
            vec!["tab\there", "newline\nthere"],
        ];
        for (i, elements) in cases.iter().enumerate() {
            let vals: Vec<Value> = elements.iter().map(|s| heap.str(*s)).collect();
            let list = heap.list(vals);
            let text = list.as_str().to_string();
            let reparsed = heap.str(text);
            let back = reparsed.list_elements(&mut heap);
            let got: Vec<String> = back.iter().map(|v| v.as_str().to_string()).collect();
            assert_eq!(&got, elements, "list round trip #{} failed", i + 1);
        }
    }

    #[test]
    fn test_list_index_semantics() {
        let mut heap = Heap::new();
        let l = heap.str("a b c");
        assert_eq!(&*l.list_index(&mut heap, 0).unwrap().as_str(), "a");
        assert_eq!(&*l.list_index(&mut heap, 2).unwrap().as_str(), "c");
        assert_eq!(&*l.list_index(&mut heap, -1).unwrap().as_str(), "c");
        assert_eq!(&*l.list_index(&mut heap, -3).unwrap().as_str(), "a");
        assert!(l.list_index(&mut heap, 3).is_none());
        assert!(l.list_index(&mut heap, -4).is_none());
    }

    #[test]
    fn test_index_parsing() {
        let mut heap = Heap::new();
        let cases = vec![("5", 5), ("end", -1), ("end-3", -4), ("0", 0)];
        for (src, want) in cases {
            let v = heap.str(src);
            assert_eq!(v.get_index(), Ok(want), "{src:?}");
        }
        let bad = heap.str("first");
        assert_eq!(
            bad.get_index().unwrap_err(),
            "bad index \"first\": must be integer or end?-integer?"
        );
    }

    #[test]
    fn test_dict_round_trip() {
        let mut heap = Heap::new();
        let k1 = heap.str("x");
        let v1 = heap.str("1");
        let k2 = heap.str("key with space");
        let v2 = heap.str("2");
        let d = heap.dict(&[k1.clone(), v1, k2.clone(), v2]);
        let text = d.as_str().to_string();
        let reparsed = heap.str(text);
        let pairs = reparsed.dict_pairs(&mut heap).unwrap();
        assert_eq!(pairs.len(), 2);
        let mut get = |k: &Value| {
            reparsed
                .dict_get(&mut heap, k)
                .unwrap()
                .map(|v| v.as_str().to_string())
        };
        assert_eq!(get(&k1), Some("1".to_string()));
        assert_eq!(get(&k2), Some("2".to_string()));
    }

    #[test]
    fn test_dict_odd_elements_fails() {
        let mut heap = Heap::new();
        let v = heap.str("a 1 b");
        assert_eq!(
            v.ensure_dict(&mut heap).unwrap_err(),
            "missing value to go with key"
        );
    }

    #[test]
    fn test_append_family() {
        let mut heap = Heap::new();
        let v = heap.str("foo");
        v.append_str("bar");
        assert_eq!(&*v.as_str(), "foobar");
        // Appending to a non-string rep coerces it.
        let n = heap.int(12);
        n.append_str("34");
        assert_eq!(&*n.as_str(), "1234");
        assert_eq!(n.type_name(), "string");
    }

    #[test]
    fn test_eq_immediate_caches() {
        let mut heap = Heap::new();
        let v = heap.str("else");
        assert!(v.eq_immediate("else"));
        assert_eq!(v.type_name(), "compared-string");
        assert!(v.eq_immediate("else"));
        assert!(!v.eq_immediate("elseif"));
    }

    #[test]
    fn test_retcode_values() {
        let mut heap = Heap::new();
        for (src, want) in [
            ("ok", Retcode::Ok),
            ("ERROR", Retcode::Err),
            ("break", Retcode::Break),
            ("3", Retcode::Break),
            ("0", Retcode::Ok),
        ] {
            let v = heap.str(src);
            assert_eq!(v.get_retcode(), Ok(want), "{src:?}");
        }
        let bad = heap.str("sideways");
        assert_eq!(
            bad.get_retcode().unwrap_err(),
            "Expected return code but got 'sideways'"
        );
    }

    #[test]
    fn test_element_quoting_choices() {
        let mut heap = Heap::new();
        // (elements, expected canonical string)
        let cases = vec![
            (vec!["a", "b"], "a b"),
            (vec!["a b"], "{a b}"),
            (vec![""], "{}"),
            (vec!["{x}"], "{{x}}"),
            (vec!["a}b"], "a\\}b"),
            (vec!["end\\"], "end\\\\"),
        ];
        for (elements, want) in cases {
            let vals: Vec<Value> = elements.iter().map(|s| heap.str(*s)).collect();
            let list = heap.list(vals);
            assert_eq!(&*list.as_str(), want, "{elements:?}");
        }
    }

    #[test]
    fn test_live_registry_tracks_drops() {
        let mut heap = Heap::new();
        let keep = heap.str("keep");
        {
            let _drop_me = heap.str("transient");
        }
        let (alive, stale) = heap.live_counts();
        assert_eq!(alive, 1);
        assert_eq!(stale, 1);
        assert_eq!(heap.live_values().len(), 1);
        drop(keep);
        assert_eq!(heap.live_values().len(), 0);
    }
}
