//! Interpreter state and the evaluator. One [`Interp`] owns the value heap,
//! the callframe chain, the command registry, the references table and the
//! interpreter result; scripts run to completion on the calling thread.
//!
//! Evaluation walks a compiled script command by command. Each argument is
//! either a single token - taken by a fast path that reads the literal,
//! resolves the variable, expands dictionary sugar or runs the nested
//! script - or several tokens whose string forms are concatenated
//! ("interpolation"). Command names resolve through an epoch-checked cache;
//! names that resolve to nothing fall back to the `unknown` handler.
//! Procedures get a fresh callframe, positional bindings and, when their
//! arity is open ended, a trailing `args` list.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::commands;
use crate::parser::TokenKind;
use crate::refs::Reference;
use crate::script::{self, ScriptToken};
use crate::value::{Heap, Rep, Value};
use crate::{CmdResult, Flow, MAX_NESTING_DEPTH, Retcode};

/// Native command implementation.
pub type NativeFn = dyn Fn(&mut Interp, &[Value]) -> CmdResult;

pub(crate) enum CmdKind {
    Native(Rc<NativeFn>),
    Proc { args: Value, body: Value },
}

/// A registered command: a native handler or a user procedure, with arity
/// bounds (`-1` means unbounded).
pub struct Cmd {
    pub(crate) kind: CmdKind,
    pub(crate) arity_min: i32,
    pub(crate) arity_max: i32,
}

/// A variable record either owns a value or links to a `(name, frame)` pair
/// established by `upvar`/`global`.
pub(crate) enum Var {
    Owned(Value),
    Link { target: Value, frame: usize },
}

/// One scope. Frames live in a slot arena and freed slots are recycled; the
/// `id` is globally unique and changes whenever cached variable lookups into
/// the frame must be re-resolved.
pub(crate) struct Frame {
    pub(crate) id: u64,
    pub(crate) vars: HashMap<String, Rc<RefCell<Var>>>,
    pub(crate) parent: Option<usize>,
    pub(crate) argv: Vec<Value>,
    pub(crate) proc_args: Option<Value>,
    pub(crate) proc_body: Option<Value>,
}

enum Resolve {
    Found(Rc<RefCell<Var>>),
    DictSugar,
    NotFound,
}

fn name_is_dict_sugar(name: &str) -> bool {
    name.ends_with(')') && name.contains('(')
}

/// The interpreter.
pub struct Interp {
    pub(crate) heap: Heap,
    commands: HashMap<String, Rc<Cmd>>,
    proc_epoch: u64,
    frames: Vec<Frame>,
    free_frames: Vec<usize>,
    pub(crate) current: usize,
    frame_epoch: u64,
    pub(crate) num_levels: usize,
    /// Procedure nesting limit; evaluation stops with an error beyond it.
    pub max_nesting_depth: usize,
    pub(crate) result: Value,
    pub(crate) return_code: Retcode,
    error_flag: bool,
    error_file: String,
    error_line: u32,
    stack_trace: Value,
    unknown: Value,
    pub(crate) references: HashMap<i64, Reference>,
    pub(crate) ref_next_id: i64,
    pub(crate) last_collect_id: i64,
    pub(crate) last_collect_time: Instant,
}

impl Interp {
    /// Create an interpreter with the core command set registered and the
    /// standard configuration variables in place.
    pub fn new() -> Interp {
        let mut heap = Heap::new();
        let result = heap.empty();
        let stack_trace = heap.list(Vec::new());
        let unknown = heap.str("unknown");
        let mut interp = Interp {
            heap,
            commands: HashMap::new(),
            proc_epoch: 0,
            frames: Vec::new(),
            free_frames: Vec::new(),
            current: 0,
            frame_epoch: 0,
            num_levels: 0,
            max_nesting_depth: MAX_NESTING_DEPTH,
            result,
            return_code: Retcode::Ok,
            error_flag: false,
            error_file: String::new(),
            error_line: 0,
            stack_trace,
            unknown,
            references: HashMap::new(),
            ref_next_id: 0,
            last_collect_id: 0,
            last_collect_time: Instant::now(),
        };
        // The top frame is born with the interpreter and dies with it.
        interp.alloc_frame(None);
        let libpath = interp.heap.str("./ /usr/local/lib/tclet");
        let _ = interp.set_var("jim::libpath", libpath);
        commands::register_core(&mut interp);
        interp
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ----- result and error state ----------------------------------------

    pub fn result(&self) -> &Value {
        &self.result
    }

    pub fn set_result(&mut self, v: Value) {
        self.result = v;
    }

    pub(crate) fn set_result_string(&mut self, s: impl Into<String>) {
        self.result = self.heap.str(s.into());
    }

    pub(crate) fn set_empty_result(&mut self) {
        self.result = self.heap.empty();
    }

    /// Store `msg` as the result and hand back the error flow, so commands
    /// can write `return Err(interp.error(...))`.
    pub fn error(&mut self, msg: impl Into<String>) -> Flow {
        self.set_result_string(msg);
        Flow::Err
    }

    /// Standard arity complaint: the first `count` words of `argv` followed
    /// by the usage text.
    pub fn wrong_num_args(&mut self, count: usize, argv: &[Value], msg: &str) -> Flow {
        let mut s = String::from("wrong # args: should be \"");
        for v in argv.iter().take(count) {
            s.push_str(&v.as_str());
            s.push(' ');
        }
        s.push_str(msg);
        s.push('"');
        self.error(s)
    }

    /// File and line of the first failure of the last evaluation.
    pub fn error_location(&self) -> (&str, u32) {
        (&self.error_file, self.error_line)
    }

    /// Stack trace of the last failure: a flat list of
    /// (procedure, file, line) triples.
    pub fn stack_trace(&self) -> &Value {
        &self.stack_trace
    }

    pub(crate) fn append_stack_trace(&mut self, proc: &str, file: &str, line: u32) {
        if self.stack_trace.handle_count() > 1 {
            self.stack_trace = self.stack_trace.duplicate(&mut self.heap);
        }
        let p = self.heap.str(proc);
        let f = self.heap.str(file);
        let l = self.heap.int(line as i64);
        for v in [p, f, l] {
            self.stack_trace.list_push(&mut self.heap, v);
        }
    }

    pub(crate) fn reset_stack_trace(&mut self) {
        self.stack_trace = self.heap.list(Vec::new());
    }

    // ----- conversion helpers that report through the result --------------

    pub(crate) fn wide_of(&mut self, v: &Value) -> Result<i64, Flow> {
        v.get_wide().map_err(|m| self.error(m))
    }

    pub(crate) fn double_of(&mut self, v: &Value) -> Result<f64, Flow> {
        v.get_double().map_err(|m| self.error(m))
    }

    pub(crate) fn index_of(&mut self, v: &Value) -> Result<i64, Flow> {
        v.get_index().map_err(|m| self.error(m))
    }

    // ----- callframes ------------------------------------------------------

    fn alloc_frame(&mut self, parent: Option<usize>) -> usize {
        let id = self.frame_epoch;
        self.frame_epoch += 1;
        if let Some(idx) = self.free_frames.pop() {
            let f = &mut self.frames[idx];
            f.id = id;
            f.parent = parent;
            idx
        } else {
            self.frames.push(Frame {
                id,
                vars: HashMap::new(),
                parent,
                argv: Vec::new(),
                proc_args: None,
                proc_body: None,
            });
            self.frames.len() - 1
        }
    }

    fn free_frame(&mut self, idx: usize) {
        let f = &mut self.frames[idx];
        f.vars.clear();
        f.argv.clear();
        f.proc_args = None;
        f.proc_body = None;
        self.free_frames.push(idx);
    }

    /// Body of the procedure whose frame is current, if any.
    pub(crate) fn current_proc_body(&self) -> Option<Value> {
        self.frames[self.current].proc_body.clone()
    }

    /// Run `f` with another frame current, restoring afterwards.
    pub(crate) fn with_frame<R>(&mut self, frame: usize, f: impl FnOnce(&mut Interp) -> R) -> R {
        let saved = self.current;
        self.current = frame;
        let r = f(self);
        self.current = saved;
        r
    }

    /// Resolve a level argument (`N` back, or `#N` absolute) to a frame.
    pub(crate) fn frame_by_level(&mut self, level: Option<&Value>) -> Result<usize, Flow> {
        let mut back: i64 = 1;
        if let Some(v) = level {
            let s = v.as_str();
            if let Some(rest) = s.strip_prefix('#') {
                if rest == "0" {
                    return Ok(0);
                }
                let abs = match crate::value::parse_wide(rest) {
                    Ok(n) if n >= 0 => n,
                    _ => return Err(self.error("Bad level")),
                };
                back = self.num_levels as i64 - abs;
                if back < 0 {
                    return Err(self.error("Bad level"));
                }
            } else {
                back = match v.get_wide() {
                    Ok(n) if n >= 0 => n,
                    _ => return Err(self.error("Bad level")),
                };
            }
        }
        let mut frame = self.current;
        while back > 0 {
            frame = match self.frames[frame].parent {
                Some(p) => p,
                None => return Err(self.error("Bad level")),
            };
            back -= 1;
        }
        Ok(frame)
    }

    /// Arguments that entered the procedure frame at `level`, for
    /// `info level N`.
    pub(crate) fn info_level(&mut self, level: &Value) -> Result<Value, Flow> {
        let frame = self.frame_by_level(Some(level))?;
        if frame == 0 {
            return Err(self.error("Bad level"));
        }
        let argv = self.frames[frame].argv.clone();
        Ok(self.heap.list(argv))
    }

    // ----- variables -------------------------------------------------------

    /// Resolve `name` in the current frame, re-using the resolution cached
    /// on the value while its frame id is still current.
    fn resolve_variable(&mut self, name: &Value) -> Resolve {
        let cur_id = self.frames[self.current].id;
        {
            if let Rep::Var { frame_id, var } = &*name.rep()
                && *frame_id == cur_id
                && let Some(rc) = var.upgrade()
            {
                return Resolve::Found(rc);
            }
        }
        let s = name.as_str();
        if name_is_dict_sugar(&s) {
            return Resolve::DictSugar;
        }
        match self.frames[self.current].vars.get(&*s) {
            Some(rc) => {
                let rc = Rc::clone(rc);
                name.set_rep(Rep::Var {
                    frame_id: cur_id,
                    var: Rc::downgrade(&rc),
                });
                Resolve::Found(rc)
            }
            None => Resolve::NotFound,
        }
    }

    /// Create or update a variable. A `name(key)` form sets a key inside a
    /// dictionary variable; links are followed to their owner.
    pub fn set_variable(&mut self, name: &Value, val: Value) -> CmdResult {
        match self.resolve_variable(name) {
            Resolve::DictSugar => self.dict_sugar_set(name, Some(val)),
            Resolve::NotFound => {
                let key = name.as_str().to_string();
                let var = Rc::new(RefCell::new(Var::Owned(val)));
                let frame_id = self.frames[self.current].id;
                self.frames[self.current].vars.insert(key, Rc::clone(&var));
                name.set_rep(Rep::Var {
                    frame_id,
                    var: Rc::downgrade(&var),
                });
                Ok(())
            }
            Resolve::Found(var) => {
                let link = match &*var.borrow() {
                    Var::Owned(_) => None,
                    Var::Link { target, frame } => Some((target.clone(), *frame)),
                };
                match link {
                    None => {
                        *var.borrow_mut() = Var::Owned(val);
                        Ok(())
                    }
                    Some((target, frame)) => {
                        self.with_frame(frame, |interp| interp.set_variable(&target, val))
                    }
                }
            }
        }
    }

    /// Read a variable; `errmsg` selects whether a missing name leaves the
    /// "no such variable" message in the result.
    pub(crate) fn get_variable(&mut self, name: &Value, errmsg: bool) -> Option<Value> {
        match self.resolve_variable(name) {
            Resolve::DictSugar => self.dict_sugar_get(name),
            Resolve::NotFound => {
                if errmsg {
                    let msg = format!("Can't read \"{}\": no such variable", name.as_str());
                    self.set_result_string(msg);
                }
                None
            }
            Resolve::Found(var) => {
                let (target, frame) = match &*var.borrow() {
                    Var::Owned(v) => return Some(v.clone()),
                    Var::Link { target, frame } => (target.clone(), *frame),
                };
                let found =
                    self.with_frame(frame, |interp| interp.get_variable(&target, false));
                if found.is_none() && errmsg {
                    let msg = format!("Can't read \"{}\": no such variable", name.as_str());
                    self.set_result_string(msg);
                }
                found
            }
        }
    }

    /// Remove a variable, invalidating cached lookups into its frame.
    pub(crate) fn unset_variable(&mut self, name: &Value, errmsg: bool) -> CmdResult {
        match self.resolve_variable(name) {
            Resolve::DictSugar => self.dict_sugar_set(name, None),
            Resolve::NotFound => {
                let msg = format!("Can't unset \"{}\": no such variable", name.as_str());
                self.set_result_string(msg);
                Err(Flow::Err)
            }
            Resolve::Found(var) => {
                let link = match &*var.borrow() {
                    Var::Owned(_) => None,
                    Var::Link { target, frame } => Some((target.clone(), *frame)),
                };
                match link {
                    Some((target, frame)) => {
                        let r = self
                            .with_frame(frame, |interp| interp.unset_variable(&target, false));
                        if r.is_err() && errmsg {
                            let msg =
                                format!("Can't unset \"{}\": no such variable", name.as_str());
                            self.set_result_string(msg);
                        }
                        r
                    }
                    None => {
                        let key = name.as_str();
                        if self.frames[self.current].vars.remove(&*key).is_none() {
                            return Err(Flow::Err);
                        }
                        let id = self.frame_epoch;
                        self.frame_epoch += 1;
                        self.frames[self.current].id = id;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Read the value of a variable and whether it is shared, measured
    /// before the returned handle was taken.
    pub(crate) fn var_value_shared(
        &mut self,
        name: &Value,
        errmsg: bool,
    ) -> Option<(Value, bool)> {
        let v = self.get_variable(name, errmsg)?;
        // Owner plus our fresh handle account for two.
        let shared = v.handle_count() > 2;
        Some((v, shared))
    }

    /// Create a link from `local` in the current frame to `target_name` in
    /// `target_frame`, rejecting cycles within one frame.
    pub(crate) fn set_variable_link(
        &mut self,
        local: &Value,
        target_name: &Value,
        target_frame: usize,
    ) -> CmdResult {
        if self.current == target_frame {
            // A chain inside one frame may loop back to where it started.
            let mut obj = target_name.clone();
            loop {
                if obj.eq_bytes(local) {
                    return Err(self.error("can't upvar from variable to itself"));
                }
                match self.resolve_variable(&obj) {
                    Resolve::Found(var) => {
                        let next = match &*var.borrow() {
                            Var::Link { target, frame } if *frame == target_frame => {
                                Some(target.clone())
                            }
                            _ => None,
                        };
                        match next {
                            Some(t) => obj = t,
                            None => break,
                        }
                    }
                    _ => break,
                }
            }
        }
        {
            let s = local.as_str();
            if name_is_dict_sugar(&s) {
                return Err(self.error("Dict key syntax invalid as link source"));
            }
        }
        self.set_variable(local, target_name.clone())?;
        if let Resolve::Found(var) = self.resolve_variable(local) {
            *var.borrow_mut() = Var::Link {
                target: target_name.clone(),
                frame: target_frame,
            };
        }
        Ok(())
    }

    // ----- dictionary sugar ------------------------------------------------

    /// Split `name(key)` into its variable-name and key values.
    fn dict_sugar_parse(&mut self, v: &Value) -> (Value, Value) {
        let s = v.as_str();
        let open = s.find('(').unwrap_or(0);
        let name = s[..open].to_string();
        let key = s[open + 1..s.len() - 1].to_string();
        (self.heap.str(name), self.heap.str(key))
    }

    fn dict_sugar_set(&mut self, name: &Value, val: Option<Value>) -> CmdResult {
        let (var_name, key) = self.dict_sugar_parse(name);
        let r = self.set_dict_keys(&var_name, &[key], val);
        if r.is_err() {
            let msg = format!(
                "Variable '{}' does not contain a valid dictionary",
                var_name.as_str()
            );
            self.set_result_string(msg);
        }
        r
    }

    fn dict_sugar_get(&mut self, name: &Value) -> Option<Value> {
        let (var_name, key) = self.dict_sugar_parse(name);
        let dict = self.get_variable(&var_name, true)?;
        match dict.dict_get(&mut self.heap, &key) {
            Ok(Some(v)) => Some(v),
            _ => {
                let msg = format!(
                    "Variable '{}' does not contain a valid dictionary",
                    var_name.as_str()
                );
                self.set_result_string(msg);
                None
            }
        }
    }

    /// Expand a `name(key)` token at call time: the key portion is itself
    /// substituted before the lookup.
    pub(crate) fn expand_dict_sugar(&mut self, token: &Value) -> Result<Value, Flow> {
        let (var_name, key) = self.dict_sugar_parse(token);
        let key = self.subst_value(&key, 0)?;
        let Some(dict) = self.get_variable(&var_name, true) else {
            return Err(Flow::Err);
        };
        match dict.dict_get(&mut self.heap, &key) {
            Ok(Some(v)) => Ok(v),
            _ => {
                let msg = format!(
                    "Variable '{}' does not contain a valid dictionary",
                    var_name.as_str()
                );
                Err(self.error(msg))
            }
        }
    }

    /// Follow `keys` into the dictionary value `dict` and return the value
    /// at the end of the path.
    pub(crate) fn dict_keys_vector(
        &mut self,
        dict: &Value,
        keys: &[Value],
        errmsg: bool,
    ) -> Result<Value, Flow> {
        let mut cur = dict.clone();
        for key in keys {
            let next = match cur.dict_get(&mut self.heap, key) {
                Ok(Some(v)) => v,
                Ok(None) => {
                    if errmsg {
                        let msg =
                            format!("key \"{}\" not found in dictionary", key.as_str());
                        self.set_result_string(msg);
                    }
                    return Err(Flow::Err);
                }
                Err(m) => return Err(self.error(m)),
            };
            cur = next;
        }
        Ok(cur)
    }

    /// Write (or with `None` remove) the element reached by `keys` inside
    /// the dictionary variable `var_name`, copy-on-write along the path.
    pub(crate) fn set_dict_keys(
        &mut self,
        var_name: &Value,
        keys: &[Value],
        newval: Option<Value>,
    ) -> CmdResult {
        debug_assert!(!keys.is_empty());
        let fetched = self.var_value_shared(var_name, false);
        let (root, shared) = match fetched {
            Some(pair) => pair,
            None => {
                let fresh = self.heap.dict(&[]);
                self.set_variable(var_name, fresh.clone())?;
                (fresh, false)
            }
        };
        let root = if shared {
            root.duplicate(&mut self.heap)
        } else {
            root
        };
        let mut cur = root.clone();
        for key in &keys[..keys.len() - 1] {
            cur.ensure_dict(&mut self.heap).map_err(|m| self.error(m))?;
            cur.invalidate_string();
            let next = match cur.dict_entry_for_write(&mut self.heap, key) {
                Ok(Some(v)) => v,
                Ok(None) => {
                    if newval.is_none() {
                        let msg =
                            format!("key \"{}\" not found in dictionary", key.as_str());
                        return Err(self.error(msg));
                    }
                    let fresh = self.heap.dict(&[]);
                    cur.dict_set(&mut self.heap, key, Some(fresh.clone()))
                        .map_err(|m| self.error(m))?;
                    fresh
                }
                Err(m) => return Err(self.error(m)),
            };
            cur = next;
        }
        cur.dict_set(&mut self.heap, &keys[keys.len() - 1], newval)
            .map_err(|m| self.error(m))?;
        cur.invalidate_string();
        root.invalidate_string();
        if shared {
            self.set_variable(var_name, root.clone())?;
        }
        self.result = root;
        Ok(())
    }

    // ----- command registry ------------------------------------------------

    /// Register a native command. Replacing an existing command invalidates
    /// cached resolutions; live callers of the old definition are unaffected.
    pub fn register_command<F>(&mut self, name: &str, arity_min: i32, arity_max: i32, func: F)
    where
        F: Fn(&mut Interp, &[Value]) -> CmdResult + 'static,
    {
        self.create_command(name, Rc::new(func), arity_min, arity_max);
    }

    pub(crate) fn create_command(
        &mut self,
        name: &str,
        func: Rc<NativeFn>,
        arity_min: i32,
        arity_max: i32,
    ) {
        let cmd = Rc::new(Cmd {
            kind: CmdKind::Native(func),
            arity_min,
            arity_max,
        });
        if self.commands.insert(name.to_string(), cmd).is_some() {
            self.proc_epoch += 1;
        }
        log::trace!("native command {name} registered");
    }

    pub(crate) fn create_procedure(
        &mut self,
        name: &str,
        args: Value,
        body: Value,
        arity_min: i32,
        arity_max: i32,
    ) {
        let cmd = Rc::new(Cmd {
            kind: CmdKind::Proc { args, body },
            arity_min,
            arity_max,
        });
        if self.commands.insert(name.to_string(), cmd).is_some() {
            self.proc_epoch += 1;
        }
        log::trace!("procedure {name} registered");
    }

    pub(crate) fn delete_command(&mut self, name: &str) -> bool {
        let removed = self.commands.remove(name).is_some();
        if removed {
            self.proc_epoch += 1;
            log::trace!("command {name} deleted");
        }
        removed
    }

    /// Rename a command; an empty target deletes it.
    pub(crate) fn rename_command(&mut self, old: &str, new: &str) -> bool {
        if new.is_empty() {
            return self.delete_command(old);
        }
        let Some(cmd) = self.commands.get(old).cloned() else {
            return false;
        };
        self.commands.insert(new.to_string(), cmd);
        self.delete_command(old)
    }

    pub(crate) fn command_names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    /// Resolve a command name, reusing the resolution cached on the value
    /// while the registry epoch still matches.
    pub(crate) fn get_command(&mut self, name: &Value, errmsg: bool) -> Option<Rc<Cmd>> {
        {
            if let Rep::Command { epoch, cmd } = &*name.rep()
                && *epoch == self.proc_epoch
            {
                return Some(Rc::clone(cmd));
            }
        }
        let s = name.as_str();
        match self.commands.get(&*s) {
            Some(cmd) => {
                let cmd = Rc::clone(cmd);
                name.set_rep(Rep::Command {
                    epoch: self.proc_epoch,
                    cmd: Rc::clone(&cmd),
                });
                Some(cmd)
            }
            None => {
                if errmsg {
                    let msg = format!("invalid command name \"{s}\"");
                    self.set_result_string(msg);
                }
                None
            }
        }
    }

    // ----- evaluation ------------------------------------------------------

    /// Evaluate script text.
    pub fn eval(&mut self, text: &str) -> CmdResult {
        let v = self.heap.str(text);
        self.eval_value(&v)
    }

    /// Evaluate a whole file; errors carry the file name and line.
    pub fn eval_file(&mut self, path: &str) -> CmdResult {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                let msg = format!("Error loading script \"{path}\": {e}");
                return Err(self.error(msg));
            }
        };
        log::debug!("evaluating file {path} ({} bytes)", text.len());
        let v = self.heap.str(text);
        let file = self.heap.intern(path);
        v.set_source(file, 1);
        self.eval_value(&v)
    }

    /// Evaluate a script value through its compiled representation.
    pub fn eval_value(&mut self, script: &Value) -> CmdResult {
        self.error_flag = false;
        // A non-empty list with no string image dispatches directly: its
        // elements are exactly the command words.
        let fast = {
            if !script.has_string() {
                match &*script.rep() {
                    Rep::List(e) if !e.is_empty() => Some(e.clone()),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some(words) = fast {
            return self.eval_vector(&words);
        }

        // Hold our own handle on the compiled script: nothing the commands
        // below do to the value can free the program under us.
        let rep = script::script_of(&mut self.heap, script);
        let file_name = self.heap.resolve(rep.file).to_string();
        self.set_empty_result();

        let tokens = &rep.tokens;
        let layout = &rep.layout;
        let mut flow: CmdResult = Ok(());
        let mut err_line = 0u32;
        let mut i = 0usize;
        let mut cs = 0usize;
        'script: while i < tokens.len() {
            let mut expand = false;
            let mut argc = layout[cs];
            cs += 1;
            if argc == -1 {
                expand = true;
                argc = layout[cs];
                cs += 1;
            }
            let first_tok = i;
            let mut argv: SmallVec<[Value; 8]> = SmallVec::new();
            let mut arg_spread: SmallVec<[bool; 8]> = SmallVec::new();
            for _ in 0..argc {
                let raw = layout[cs];
                cs += 1;
                arg_spread.push(raw < 0);
                let ntok = if raw < 0 {
                    i += 1; // step over the expand word itself
                    (-raw - 1) as usize
                } else {
                    raw as usize
                };
                let tok_line = tokens.get(i).map(|t| t.line).unwrap_or(0);
                let arg = if ntok == 1 {
                    let tok = &tokens[i];
                    let one = match tok.kind {
                        TokenKind::Esc | TokenKind::Str => Ok(tok.value.clone()),
                        TokenKind::Var => {
                            self.get_variable(&tok.value, true).ok_or(Flow::Err)
                        }
                        TokenKind::DictSugar => self.expand_dict_sugar(&tok.value),
                        TokenKind::Cmd => match self.eval_value(&tok.value) {
                            Ok(()) => Ok(self.result.clone()),
                            Err(f) => Err(f),
                        },
                        _ => Ok(tok.value.clone()),
                    };
                    i += 2;
                    one
                } else {
                    let r = self.interpolate_tokens(&tokens[i..i + ntok]);
                    i += ntok + 1;
                    r
                };
                match arg {
                    Ok(v) => argv.push(v),
                    Err(f) => {
                        flow = Err(f);
                        err_line = tok_line;
                        break 'script;
                    }
                }
            }
            // List expansion: each flagged argument is replaced by the
            // elements of the list it interpolated to.
            if expand {
                let mut spread: SmallVec<[Value; 8]> = SmallVec::new();
                for (idx, v) in argv.drain(..).enumerate() {
                    if arg_spread[idx] {
                        for ele in v.list_elements(&mut self.heap) {
                            spread.push(ele);
                        }
                    } else {
                        spread.push(v);
                    }
                }
                argv = spread;
                if argv.is_empty() {
                    continue 'script;
                }
            }
            let r = match self.get_command(&argv[0], true) {
                Some(cmd) => {
                    self.set_empty_result();
                    match &cmd.kind {
                        CmdKind::Native(f) => {
                            let f = Rc::clone(f);
                            f(self, &argv)
                        }
                        CmdKind::Proc { .. } => {
                            let r = self.call_procedure(&cmd, &argv);
                            if r == Err(Flow::Err) {
                                let name = argv[0].as_str();
                                self.append_stack_trace(
                                    &name,
                                    &file_name,
                                    tokens[first_tok].line,
                                );
                            }
                            r
                        }
                    }
                }
                None => self.eval_unknown(&argv),
            };
            if let Err(f) = r {
                flow = Err(f);
                err_line = tokens[first_tok].line;
                break 'script;
            }
        }
        // Latch the location of the first failure; nested evaluations that
        // already latched keep theirs.
        if flow == Err(Flow::Err) && !self.error_flag {
            self.error_flag = true;
            self.error_file = file_name;
            self.error_line = err_line;
            self.reset_stack_trace();
        }
        flow
    }

    /// Dispatch an argument vector directly, one value per word.
    pub fn eval_vector(&mut self, argv: &[Value]) -> CmdResult {
        debug_assert!(!argv.is_empty());
        match self.get_command(&argv[0], true) {
            Some(cmd) => {
                self.set_empty_result();
                match &cmd.kind {
                    CmdKind::Native(f) => {
                        let f = Rc::clone(f);
                        f(self, argv)
                    }
                    CmdKind::Proc { .. } => {
                        let r = self.call_procedure(&cmd, argv);
                        if r == Err(Flow::Err) {
                            let name = argv[0].as_str();
                            self.append_stack_trace(&name, "?", 1);
                        }
                        r
                    }
                }
            }
            None => self.eval_unknown(argv),
        }
    }

    /// Dispatch failed: hand the original words to the `unknown` handler,
    /// prefixed by its name. Without a handler the resolution error stands.
    fn eval_unknown(&mut self, argv: &[Value]) -> CmdResult {
        let unknown = self.unknown.clone();
        if self.get_command(&unknown, false).is_none() {
            return Err(Flow::Err);
        }
        let mut v: Vec<Value> = Vec::with_capacity(argv.len() + 1);
        v.push(unknown);
        v.extend_from_slice(argv);
        self.eval_vector(&v)
    }

    /// Concatenate the string forms of a multi-token argument into one
    /// fresh value.
    fn interpolate_tokens(&mut self, toks: &[ScriptToken]) -> Result<Value, Flow> {
        let mut parts: SmallVec<[Rc<str>; 8]> = SmallVec::new();
        for tok in toks {
            let v = match tok.kind {
                TokenKind::Esc | TokenKind::Str => tok.value.clone(),
                TokenKind::Var => self.get_variable(&tok.value, true).ok_or(Flow::Err)?,
                TokenKind::DictSugar => self.expand_dict_sugar(&tok.value)?,
                TokenKind::Cmd => {
                    self.eval_value(&tok.value)?;
                    self.result.clone()
                }
                _ => tok.value.clone(),
            };
            parts.push(v.as_str());
        }
        let total = parts.iter().map(|p| p.len()).sum();
        let mut out = String::with_capacity(total);
        for p in &parts {
            out.push_str(p);
        }
        Ok(self.heap.str(out))
    }

    /// The procedure call path: arity check, depth guard, fresh frame,
    /// argument binding, body evaluation, one level of `return` absorption.
    pub(crate) fn call_procedure(&mut self, cmd: &Rc<Cmd>, argv: &[Value]) -> CmdResult {
        let CmdKind::Proc { args, body } = &cmd.kind else {
            return Err(self.error("not a procedure"));
        };
        let args = args.clone();
        let body = body.clone();
        let argc = argv.len() as i64;
        if argc < cmd.arity_min as i64 || (cmd.arity_max != -1 && argc > cmd.arity_max as i64) {
            let msg = format!(
                "wrong # args: should be \"{}{}{}\"",
                argv[0].as_str(),
                if cmd.arity_min > 1 { " " } else { "" },
                args.as_str()
            );
            return Err(self.error(msg));
        }
        if self.num_levels == self.max_nesting_depth {
            return Err(self.error("Too many nested calls. Infinite recursion?"));
        }
        let parent = self.current;
        let frame = self.alloc_frame(Some(parent));
        {
            let f = &mut self.frames[frame];
            f.argv = argv.to_vec();
            f.proc_args = Some(args.clone());
            f.proc_body = Some(body.clone());
        }
        self.current = frame;
        self.num_levels += 1;
        let positional = (cmd.arity_min - 1).max(0) as usize;
        for idx in 0..positional {
            if let Some(formal) = args.list_index(&mut self.heap, idx as i64) {
                let _ = self.set_variable(&formal, argv[idx + 1].clone());
            }
        }
        if cmd.arity_max == -1 {
            // The trailing formal collects the remaining words as a list.
            let rest: Vec<Value> = argv[(cmd.arity_min as usize).min(argv.len())..].to_vec();
            let rest = self.heap.list(rest);
            if let Some(formal) = args.list_index(&mut self.heap, positional as i64) {
                let _ = self.set_variable(&formal, rest);
            }
        }
        let retcode = self.eval_value(&body);
        self.num_levels -= 1;
        self.current = parent;
        self.free_frame(frame);
        match retcode {
            Err(Flow::Return) => {
                let rc = self.return_code;
                self.return_code = Retcode::Ok;
                match rc {
                    Retcode::Ok => Ok(()),
                    Retcode::Err => Err(Flow::Err),
                    Retcode::Return => Err(Flow::Return),
                    Retcode::Break => Err(Flow::Break),
                    Retcode::Continue => Err(Flow::Continue),
                }
            }
            other => other,
        }
    }

    /// Perform command, variable and backslash substitution over `v` and
    /// return the resulting value. The interpreter result is preserved.
    pub fn subst_value(&mut self, v: &Value, flags: u32) -> Result<Value, Flow> {
        let rep = script::subst_of(&mut self.heap, v, flags);
        let saved = self.result.clone();
        let out = self.heap.empty();
        let mut failed = false;
        for tok in &rep.tokens {
            match tok.kind {
                TokenKind::Str | TokenKind::Esc => out.append_value(&tok.value),
                TokenKind::Var => match self.get_variable(&tok.value, true) {
                    Some(val) => out.append_value(&val),
                    None => {
                        failed = true;
                        break;
                    }
                },
                TokenKind::DictSugar => match self.expand_dict_sugar(&tok.value) {
                    Ok(val) => out.append_value(&val),
                    Err(_) => {
                        failed = true;
                        break;
                    }
                },
                TokenKind::Cmd => match self.eval_value(&tok.value) {
                    Ok(()) => {
                        let r = self.result.clone();
                        out.append_value(&r);
                    }
                    Err(_) => {
                        failed = true;
                        break;
                    }
                },
                TokenKind::Eol => {}
                _ => {}
            }
        }
        if failed {
            // The error message stays in the result.
            return Err(Flow::Err);
        }
        self.result = saved;
        Ok(out)
    }

    // ----- host conveniences -----------------------------------------------

    pub fn set_var(&mut self, name: &str, val: Value) -> CmdResult {
        let n = self.heap.str(name);
        self.set_variable(&n, val)
    }

    pub fn get_var(&mut self, name: &str) -> Option<Value> {
        let n = self.heap.str(name);
        self.get_variable(&n, false)
    }
}

impl Default for Interp {
    fn default() -> Self {
        Interp::new()
    }
}
