//! References: garbage-collected handles whose only identity is a 32-byte
//! token, `~reference:<20 digits>:`. Scripts can build arbitrary cycles out
//! of them, invisible to handle counting, so collection does not trace
//! pointers at all: it scans the canonical string of every live value that
//! can carry a token and keeps the ids it finds. Everything else in the
//! references table is swept, running finalizers as it goes.
//!
//! A collection runs opportunistically when a new reference is created and
//! enough ids or enough time have passed since the last one, and on demand
//! through the `collect` command.

use std::collections::HashSet;
use std::time::Instant;

use nom::Parser as _;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::char;
use nom::combinator::map_res;

use crate::interp::Interp;
use crate::value::{Rep, Value};
use crate::{COLLECT_ID_PERIOD, COLLECT_TIME_PERIOD, Flow, REFERENCE_SPACE};

/// A reference record: the referenced value and an optional finalizer
/// command name, called as `finalizer token value` when the reference is
/// collected.
pub(crate) struct Reference {
    pub(crate) value: Value,
    pub(crate) finalizer: Option<Value>,
}

/// Canonical token for a reference id: fixed width so the scanner can skip
/// any string shorter than it, starting with a byte rare enough to make the
/// search cheap.
pub(crate) fn format_reference(id: i64) -> String {
    format!("~reference:{id:020}:")
}

fn token_body(input: &str) -> nom::IResult<&str, i64> {
    let (input, _) = tag("~reference:").parse(input)?;
    let (input, id) = map_res(
        take_while_m_n(20, 20, |c: char| c.is_ascii_digit()),
        |digits: &str| digits.parse::<i64>(),
    )
    .parse(input)?;
    let (input, _) = char(':').parse(input)?;
    Ok((input, id))
}

/// Decode a whole string as one reference token, tolerating surrounding
/// spaces.
fn reference_id_of_str(s: &str) -> Option<i64> {
    let t = s.trim_matches(' ');
    if t.len() != REFERENCE_SPACE {
        return None;
    }
    match token_body(t) {
        Ok(("", id)) => Some(id),
        _ => None,
    }
}

/// Record every valid token embedded in `s`.
fn scan_tokens(s: &str, marks: &mut HashSet<i64>) {
    for (pos, _) in s.match_indices("~reference:") {
        if s.len() - pos < REFERENCE_SPACE {
            break;
        }
        if let Ok((_, id)) = token_body(&s[pos..]) {
            marks.insert(id);
        }
    }
}

/// Resolve a value to a reference id, caching the resolution. The id must
/// exist in the interpreter's reference table.
pub(crate) fn get_reference_id(interp: &mut Interp, v: &Value) -> Result<i64, Flow> {
    {
        if let Rep::Reference(id) = &*v.rep() {
            return Ok(*id);
        }
    }
    let s = v.as_str();
    let Some(id) = reference_id_of_str(&s) else {
        let msg = format!("Expected reference but got '{s}'");
        return Err(interp.error(msg));
    };
    if !interp.references.contains_key(&id) {
        let msg = format!("Invalid reference ID '{s}'");
        return Err(interp.error(msg));
    }
    v.set_rep(Rep::Reference(id));
    Ok(id)
}

/// Create a reference to `value` with an optional finalizer command name,
/// collecting beforehand when the trigger condition holds.
pub(crate) fn new_reference(interp: &mut Interp, value: Value, finalizer: Option<Value>) -> Value {
    collect_if_needed(interp);
    let id = interp.ref_next_id;
    interp.ref_next_id += 1;
    interp.references.insert(id, Reference { value, finalizer });
    interp.heap.alloc(None, Rep::Reference(id))
}

/// Mark and sweep. Returns how many references were collected.
pub fn collect(interp: &mut Interp) -> usize {
    // A finalizer creating references must not restart the collector.
    if interp.last_collect_id == -1 {
        return 0;
    }
    interp.last_collect_id = -1;

    // Mark: every token readable in the string form of a live value keeps
    // its reference. Reference-typed values contribute their id directly.
    let mut marks: HashSet<i64> = HashSet::new();
    {
        let live = interp.heap.live_values();
        for v in &live {
            {
                if let Rep::Reference(id) = &*v.rep() {
                    marks.insert(*id);
                    continue;
                }
            }
            if !v.scannable_for_references() {
                continue;
            }
            let s = v.as_str();
            if s.len() < REFERENCE_SPACE {
                continue;
            }
            scan_tokens(&s, &mut marks);
        }
    }

    // Sweep: drop unmarked references, invoking finalizers with the result
    // saved and restored around them; finalizer errors are swallowed.
    let dead: Vec<i64> = interp
        .references
        .keys()
        .filter(|id| !marks.contains(id))
        .copied()
        .collect();
    let mut collected = 0;
    for id in dead {
        let Some(r) = interp.references.remove(&id) else {
            continue;
        };
        collected += 1;
        if let Some(finalizer) = r.finalizer {
            let token = interp.heap.str(format_reference(id));
            let saved = interp.result().clone();
            let argv = [finalizer, token, r.value];
            let _ = interp.eval_vector(&argv);
            interp.set_result(saved);
        }
    }
    interp.last_collect_id = interp.ref_next_id;
    interp.last_collect_time = Instant::now();
    log::debug!("collected {collected} references, {} marked", marks.len());
    collected
}

/// Run a collection when enough references have been created or enough time
/// has passed since the last one.
pub(crate) fn collect_if_needed(interp: &mut Interp) {
    if interp.last_collect_id == -1 {
        return;
    }
    let elapsed_ids = interp.ref_next_id - interp.last_collect_id;
    let elapsed_secs = interp.last_collect_time.elapsed().as_secs();
    if elapsed_ids >= COLLECT_ID_PERIOD || elapsed_secs >= COLLECT_TIME_PERIOD {
        collect(interp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interp;

    #[test]
    fn test_token_format_is_bit_exact() {
        let t = format_reference(0);
        assert_eq!(t.len(), REFERENCE_SPACE);
        assert_eq!(t, "~reference:00000000000000000000:");
        assert_eq!(format_reference(42), "~reference:00000000000000000042:");
        assert_eq!(
            format_reference(12345678901234567),
            "~reference:00012345678901234567:"
        );
    }

    #[test]
    fn test_token_recognition() {
        assert_eq!(
            reference_id_of_str("~reference:00000000000000000007:"),
            Some(7)
        );
        // Surrounding spaces are tolerated, nothing else.
        assert_eq!(
            reference_id_of_str("  ~reference:00000000000000000007:  "),
            Some(7)
        );
        let bad = vec![
            "~reference:0000000000000000007:",  // 19 digits
            "~reference:000000000000000000070", // no trailing colon
            "~reference:0000000000000000000x:", // non-digit
            "reference:00000000000000000007:",  // missing tilde
            "x~reference:00000000000000000007:", // leading junk
        ];
        for s in &bad {
            assert_eq!(reference_id_of_str(s), None, "{s:?}");
        }
    }

    #[test]
    fn test_scan_finds_embedded_tokens() {
        let mut marks = HashSet::new();
        let text = format!(
            "x {} y {} z",
            format_reference(3),
            format_reference(99)
        );
        scan_tokens(&text, &mut marks);
        assert_eq!(marks.len(), 2);
        assert!(marks.contains(&3));
        assert!(marks.contains(&99));
        // Truncated trailing token contributes nothing.
        let mut marks = HashSet::new();
        scan_tokens("~reference:123", &mut marks);
        assert!(marks.is_empty());
    }

    #[test]
    fn test_ref_getref_setref() {
        let mut interp = Interp::new();
        interp.eval("set r [ref hello]").unwrap();
        let token = interp.result().as_str().to_string();
        assert_eq!(token.len(), REFERENCE_SPACE);
        interp.eval("getref $r").unwrap();
        assert_eq!(&*interp.result().as_str(), "hello");
        interp.eval("setref $r goodbye").unwrap();
        interp.eval("getref $r").unwrap();
        assert_eq!(&*interp.result().as_str(), "goodbye");
        // A malformed token is rejected.
        let r = interp.eval("getref nonsense");
        assert!(r.is_err());
        assert!(
            interp
                .result()
                .as_str()
                .contains("Expected reference but got")
        );
    }

    #[test]
    fn test_collect_keeps_reachable_references() {
        let mut interp = Interp::new();
        interp.eval("set r [ref payload]").unwrap();
        interp.eval("collect").unwrap();
        // The token still lives in the variable, so the reference stays.
        assert_eq!(interp.references.len(), 1);
        interp.eval("getref $r").unwrap();
        assert_eq!(&*interp.result().as_str(), "payload");
    }

    #[test]
    fn test_collect_reclaims_unreachable_references() {
        let mut interp = Interp::new();
        interp.eval("set r [ref payload]").unwrap();
        interp.eval("set r gone").unwrap();
        interp.eval("collect").unwrap();
        assert_eq!(&*interp.result().as_str(), "1");
        assert!(interp.references.is_empty());
    }

    #[test]
    fn test_scenario_finalizer_runs_exactly_once() {
        let mut interp = Interp::new();
        interp
            .eval("proc finalize {t v} { global log; lappend log $t $v }")
            .unwrap();
        interp.eval("set log {}").unwrap();
        interp.eval("set r [ref hello finalize]").unwrap();
        interp.eval("getref $r").unwrap();
        assert_eq!(&*interp.result().as_str(), "hello");
        let token = {
            let v = interp.get_var("r").unwrap();
            v.as_str().to_string()
        };
        // Overwrite the only holder of the token and collect.
        interp.eval("set r 0").unwrap();
        interp.eval("collect").unwrap();
        assert_eq!(&*interp.result().as_str(), "1");
        interp.eval("set log").unwrap();
        let logged = interp.result().clone();
        let items = logged.list_elements(interp.heap());
        assert_eq!(items.len(), 2, "finalizer ran once with two arguments");
        assert_eq!(&*items[0].as_str(), token.as_str());
        assert_eq!(&*items[1].as_str(), "hello");
        // A second collection has nothing left to do.
        interp.eval("collect").unwrap();
        assert_eq!(&*interp.result().as_str(), "0");
    }

    #[test]
    fn test_finalizer_errors_are_swallowed_and_result_restored() {
        let mut interp = Interp::new();
        interp
            .eval("proc finalize {t v} { error-free-this-is-not }")
            .unwrap();
        interp.eval("set r [ref x finalize]").unwrap();
        interp.eval("set r 0").unwrap();
        interp.eval("set marker before-collect").unwrap();
        let token_count = collect(&mut interp);
        assert_eq!(token_count, 1);
        // The failed finalizer left no trace in the result.
        assert_eq!(&*interp.result().as_str(), "before-collect");
    }

    #[test]
    fn test_mark_set_property_after_collect() {
        let mut interp = Interp::new();
        interp.eval("set a [ref one]").unwrap();
        interp.eval("set b [ref two]").unwrap();
        // Embed b's token inside a longer string; drop a's.
        interp.eval("set keep \"prefix $b suffix\"").unwrap();
        interp.eval("set a x; set b y").unwrap();
        interp.eval("collect").unwrap();
        // Exactly the embedded reference survived.
        assert_eq!(interp.references.len(), 1);
        interp.eval("getref [string range $keep 7 38]").unwrap();
        assert_eq!(&*interp.result().as_str(), "two");
    }

    #[test]
    fn test_lambda_core_procedure_uses_references() {
        let mut interp = Interp::new();
        interp
            .eval("set f [lambda {x} {expr {$x * $x}}]")
            .unwrap();
        interp.eval("$f 6").unwrap();
        assert_eq!(&*interp.result().as_str(), "36");
        // Dropping the lambda token makes the procedure collectable; its
        // finalizer renames the generated command away.
        interp.eval("set f {}").unwrap();
        interp.eval("collect").unwrap();
        let r = interp.eval("info commands lambda*");
        assert!(r.is_ok());
    }
}
