//! The tokenizer. A single parser context is driven byte by byte over the
//! input and produces one token per call; four entry points share it:
//!
//! - [`Parser::parse_script_token`] for command scripts,
//! - [`Parser::parse_list_token`] for list syntax (whitespace, braces and
//!   quotes only - no `$` or `[` activity),
//! - [`Parser::parse_subst_token`] for `subst`-style substitution,
//! - [`Parser::parse_expr_token`] for expressions, which adds number,
//!   operator and parenthesis tokens.
//!
//! All syntax characters are ASCII; byte runs outside ASCII pass through as
//! ordinary word characters. Tokens are windows into the source; escape
//! conversion for `Esc` tokens happens in [`Parser::token`], and the decoded
//! form is never longer than its source.

use crate::expr::operators;

/// Kind of the last token produced by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// No token produced yet.
    None,
    /// Literal run from a braced group; no escape processing.
    Str,
    /// Run that still needs backslash-escape conversion.
    Esc,
    /// `$name` variable substitution.
    Var,
    /// `$name(key)` dictionary sugar.
    DictSugar,
    /// `[...]` command substitution body.
    Cmd,
    /// Word separator (spaces, tabs, escaped newlines).
    Sep,
    /// Command separator (newline or `;`).
    Eol,
    /// `(` in an expression.
    SubexprStart,
    /// `)` in an expression.
    SubexprEnd,
    /// Numeric literal in an expression.
    ExprNumber,
    /// Operator in an expression.
    ExprOperator,
}

impl TokenKind {
    /// Upper-case name used by the tokenization dump of the CLI.
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::None => "NONE",
            TokenKind::Str => "STR",
            TokenKind::Esc => "ESC",
            TokenKind::Var => "VAR",
            TokenKind::DictSugar => "DICTSUGAR",
            TokenKind::Cmd => "CMD",
            TokenKind::Sep => "SEP",
            TokenKind::Eol => "EOL",
            TokenKind::SubexprStart => "SUBEXPR_START",
            TokenKind::SubexprEnd => "SUBEXPR_END",
            TokenKind::ExprNumber => "EXPR_NUMBER",
            TokenKind::ExprOperator => "EXPR_OPERATOR",
        }
    }
}

/// Flags for the subst dialect. Zero means full substitution.
pub const SUBST_NOVAR: u32 = 1;
pub const SUBST_NOCMD: u32 = 2;
pub const SUBST_NOESC: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    Quote,
}

/// Parser context. `tstart..tend` is the window of the current token in the
/// source text.
pub struct Parser<'a> {
    text: &'a str,
    pos: usize,
    line: u32,
    tstart: usize,
    tend: usize,
    tline: u32,
    tt: TokenKind,
    eof: bool,
    state: State,
    comment: bool,
}

impl<'a> Parser<'a> {
    /// Create a parser over `text`; `line` is the line number of its first
    /// line.
    pub fn new(text: &'a str, line: u32) -> Parser<'a> {
        Parser {
            text,
            pos: 0,
            line,
            tstart: 0,
            tend: 0,
            tline: 0,
            tt: TokenKind::None,
            eof: false,
            state: State::Default,
            comment: true,
        }
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn token_kind(&self) -> TokenKind {
        self.tt
    }

    pub fn token_line(&self) -> u32 {
        self.tline
    }

    /// Current token window, undecoded.
    pub fn token_raw(&self) -> &'a str {
        self.text.get(self.tstart..self.tend).unwrap_or("")
    }

    /// Current token with escapes applied when the token kind requires it.
    /// Returns `(text, kind, line)`.
    pub fn token(&self) -> (String, TokenKind, u32) {
        let raw = self.token_raw();
        let text = if self.tt == TokenKind::Esc {
            escape(raw)
        } else {
            raw.to_string()
        };
        (text, self.tt, self.tline)
    }

    // Byte access with a virtual NUL terminator, which keeps the state
    // machines close to their natural form.
    fn at(&self, pos: usize) -> u8 {
        self.text.as_bytes().get(pos).copied().unwrap_or(0)
    }

    fn cur(&self) -> u8 {
        self.at(self.pos)
    }

    fn peek(&self, n: usize) -> u8 {
        self.at(self.pos + n)
    }

    fn eof_token(&mut self) {
        self.tstart = self.pos;
        self.tend = self.pos;
        self.tline = self.line;
        self.tt = TokenKind::Eol;
        self.eof = true;
    }

    /// Advance over the next script token.
    pub fn parse_script_token(&mut self) {
        loop {
            match self.cur() {
                0 => {
                    self.eof_token();
                    return;
                }
                b'\\' => {
                    if self.peek(1) == b'\n' {
                        return self.parse_sep();
                    }
                    self.comment = false;
                    return self.parse_str();
                }
                b' ' | b'\t' | b'\r' => {
                    if self.state == State::Default {
                        return self.parse_sep();
                    }
                    self.comment = false;
                    return self.parse_str();
                }
                b'\n' | b';' => {
                    self.comment = true;
                    if self.state == State::Default {
                        return self.parse_eol();
                    }
                    return self.parse_str();
                }
                b'[' => {
                    self.comment = false;
                    return self.parse_cmd();
                }
                b'$' => {
                    self.comment = false;
                    if !self.parse_var() {
                        // A lone '$' is just a string.
                        self.tstart = self.pos;
                        self.tend = self.pos + 1;
                        self.tline = self.line;
                        self.tt = TokenKind::Str;
                        self.pos += 1;
                    }
                    return;
                }
                b'#' => {
                    if self.comment {
                        self.parse_comment();
                        continue;
                    }
                    return self.parse_str();
                }
                _ => {
                    self.comment = false;
                    return self.parse_str();
                }
            }
        }
    }

    fn parse_sep(&mut self) {
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\\' if self.peek(1) == b'\n' => self.pos += 2,
                _ => break,
            }
        }
        self.tend = self.pos;
        self.tt = TokenKind::Sep;
    }

    fn parse_eol(&mut self) {
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' | b';' => self.pos += 1,
                _ => break,
            }
        }
        self.tend = self.pos;
        self.tt = TokenKind::Eol;
    }

    fn parse_cmd(&mut self) {
        let mut level = 1;
        let mut blevel = 0;
        self.pos += 1;
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b'[' if blevel == 0 => level += 1,
                b']' if blevel == 0 => {
                    level -= 1;
                    if level == 0 {
                        break;
                    }
                }
                b'\\' => {
                    if self.peek(1) != 0 {
                        self.pos += 1;
                    }
                }
                b'{' => blevel += 1,
                b'}' => {
                    if blevel != 0 {
                        blevel -= 1;
                    }
                }
                0 => break,
                b'\n' => self.line += 1,
                _ => {}
            }
            self.pos += 1;
        }
        self.tend = self.pos;
        self.tt = TokenKind::Cmd;
        if self.cur() == b']' {
            self.pos += 1;
        }
    }

    /// Parse a `$name` or `${name}` or `$name(key)` token. Returns false if
    /// only the `$` character was found; the caller decides what it is then.
    fn parse_var(&mut self) -> bool {
        self.pos += 1; // skip '$'
        self.tstart = self.pos;
        self.tline = self.line;
        let mut kind = TokenKind::Var;
        if self.cur() == b'{' {
            self.pos += 1;
            self.tstart = self.pos;
            loop {
                match self.cur() {
                    b'}' => {
                        self.tend = self.pos;
                        self.pos += 1;
                        break;
                    }
                    0 => {
                        self.tend = self.pos;
                        break;
                    }
                    b'\n' => {
                        self.line += 1;
                        self.pos += 1;
                    }
                    _ => self.pos += 1,
                }
            }
        } else {
            while self.cur().is_ascii_alphanumeric() || self.cur() == b'_' {
                self.pos += 1;
            }
            // Dictionary access sugar, $name(key).
            if self.cur() == b'(' {
                while self.cur() != b')' && self.cur() != 0 {
                    self.pos += 1;
                    if self.cur() == b'\\' && self.peek(1) != 0 {
                        self.pos += 2;
                    }
                }
                if self.cur() != 0 {
                    self.pos += 1;
                }
                kind = TokenKind::DictSugar;
            }
            self.tend = self.pos;
        }
        if self.pos == self.tstart {
            // Nothing after the '$'.
            self.pos -= 1;
            return false;
        }
        self.tt = kind;
        true
    }

    fn parse_brace(&mut self) {
        let mut level = 1;
        self.pos += 1;
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b'\\' if self.peek(1) != 0 => self.pos += 1,
                b'{' => level += 1,
                0 | b'}' => {
                    level -= 1;
                    if self.cur() == 0 || level == 0 {
                        self.tend = self.pos;
                        if self.cur() != 0 {
                            self.pos += 1;
                        }
                        self.tt = TokenKind::Str;
                        return;
                    }
                }
                b'\n' => self.line += 1,
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn parse_str(&mut self) {
        let newword = matches!(
            self.tt,
            TokenKind::Sep | TokenKind::Eol | TokenKind::None | TokenKind::Str
        );
        if newword && self.cur() == b'{' {
            return self.parse_brace();
        }
        if newword && self.cur() == b'"' {
            self.state = State::Quote;
            self.pos += 1;
        }
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b'\\' => {
                    if self.state == State::Default && self.peek(1) == b'\n' {
                        self.tend = self.pos;
                        self.tt = TokenKind::Esc;
                        return;
                    }
                    if self.peek(1) != 0 {
                        self.pos += 1;
                    }
                }
                b'$' | b'[' | 0 => {
                    self.tend = self.pos;
                    self.tt = TokenKind::Esc;
                    return;
                }
                b' ' | b'\t' | b'\n' | b'\r' | b';' => {
                    if self.state == State::Default {
                        self.tend = self.pos;
                        self.tt = TokenKind::Esc;
                        return;
                    }
                    if self.cur() == b'\n' {
                        self.line += 1;
                    }
                }
                b'"' => {
                    if self.state == State::Quote {
                        self.tend = self.pos;
                        self.tt = TokenKind::Esc;
                        self.pos += 1;
                        self.state = State::Default;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn parse_comment(&mut self) {
        while self.cur() != 0 {
            if self.cur() == b'\n' {
                self.line += 1;
                if self.at(self.pos - 1) != b'\\' {
                    self.pos += 1;
                    return;
                }
            }
            self.pos += 1;
        }
    }

    /// Advance over the next list token. Lists know only whitespace, braces
    /// and double quotes.
    pub fn parse_list_token(&mut self) {
        match self.cur() {
            0 => self.eof_token(),
            b' ' | b'\n' | b'\t' | b'\r' => {
                if self.state == State::Default {
                    self.parse_list_sep()
                } else {
                    self.parse_list_str()
                }
            }
            _ => self.parse_list_str(),
        }
    }

    fn parse_list_sep(&mut self) {
        self.tstart = self.pos;
        self.tline = self.line;
        while matches!(self.cur(), b' ' | b'\t' | b'\r' | b'\n') {
            self.pos += 1;
        }
        self.tend = self.pos;
        self.tt = TokenKind::Sep;
    }

    fn parse_list_str(&mut self) {
        let newword = matches!(
            self.tt,
            TokenKind::Sep | TokenKind::Eol | TokenKind::None
        );
        if newword && self.cur() == b'{' {
            return self.parse_brace();
        }
        if newword && self.cur() == b'"' {
            self.state = State::Quote;
            self.pos += 1;
        }
        self.tstart = self.pos;
        self.tline = self.line;
        loop {
            match self.cur() {
                b'\\' => {
                    if self.peek(1) != 0 {
                        self.pos += 1;
                    }
                }
                0 => {
                    self.tend = self.pos;
                    self.tt = TokenKind::Esc;
                    return;
                }
                b' ' | b'\t' | b'\n' | b'\r' => {
                    if self.state == State::Default {
                        self.tend = self.pos;
                        self.tt = TokenKind::Esc;
                        return;
                    }
                    if self.cur() == b'\n' {
                        self.line += 1;
                    }
                }
                b'"' => {
                    if self.state == State::Quote {
                        self.tend = self.pos;
                        self.tt = TokenKind::Esc;
                        self.pos += 1;
                        self.state = State::Default;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    /// Advance over the next subst token, honoring the `SUBST_*` flags.
    pub fn parse_subst_token(&mut self, flags: u32) {
        match self.cur() {
            0 => self.eof_token(),
            b'[' => {
                self.parse_cmd();
                if flags & SUBST_NOCMD != 0 {
                    // Keep the brackets as literal text.
                    self.tstart -= 1;
                    self.tend = (self.tend + 1).min(self.text.len());
                    self.tt = if flags & SUBST_NOESC != 0 {
                        TokenKind::Str
                    } else {
                        TokenKind::Esc
                    };
                }
            }
            b'$' => {
                if !self.parse_var() {
                    self.tstart = self.pos;
                    self.tend = self.pos + 1;
                    self.tline = self.line;
                    self.tt = TokenKind::Str;
                    self.pos += 1;
                } else if flags & SUBST_NOVAR != 0 {
                    // Keep the '$' (and braces) as literal text.
                    self.tstart -= 1;
                    self.tt = if flags & SUBST_NOESC != 0 {
                        TokenKind::Str
                    } else {
                        TokenKind::Esc
                    };
                    if self.at(self.tstart) == b'{' {
                        self.tstart -= 1;
                        if self.tend < self.text.len() {
                            self.tend += 1;
                        }
                    }
                }
            }
            _ => {
                self.parse_subst_str();
                if flags & SUBST_NOESC != 0 {
                    self.tt = TokenKind::Str;
                }
            }
        }
    }

    fn parse_subst_str(&mut self) {
        self.tstart = self.pos;
        self.tline = self.line;
        while self.cur() != 0 && self.cur() != b'$' && self.cur() != b'[' {
            self.pos += 1;
        }
        self.tend = self.pos;
        self.tt = TokenKind::Esc;
    }

    /// Advance over the next expression token. Fails on text that matches no
    /// operator.
    pub fn parse_expr_token(&mut self) -> Result<(), ()> {
        // Discard whitespace and escaped newlines between tokens.
        loop {
            match self.cur() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'\\' if self.peek(1) == b'\n' => self.pos += 1,
                _ => break,
            }
        }
        match self.cur() {
            0 => {
                self.eof_token();
                Ok(())
            }
            b'(' => {
                self.tstart = self.pos;
                self.tend = self.pos + 1;
                self.tline = self.line;
                self.tt = TokenKind::SubexprStart;
                self.pos += 1;
                Ok(())
            }
            b')' => {
                self.tstart = self.pos;
                self.tend = self.pos + 1;
                self.tline = self.line;
                self.tt = TokenKind::SubexprEnd;
                self.pos += 1;
                Ok(())
            }
            b'[' => {
                self.parse_cmd();
                Ok(())
            }
            b'$' => {
                if self.parse_var() {
                    Ok(())
                } else {
                    self.parse_expr_operator()
                }
            }
            b'-' => {
                if matches!(self.tt, TokenKind::None | TokenKind::ExprOperator)
                    && self.peek(1).is_ascii_digit()
                {
                    self.parse_expr_number();
                    Ok(())
                } else {
                    self.parse_expr_operator()
                }
            }
            b'0'..=b'9' | b'.' => {
                self.parse_expr_number();
                Ok(())
            }
            b'"' | b'{' => {
                // Quoted and braced literals reuse the list string rules.
                self.tt = TokenKind::None;
                self.parse_list_str();
                Ok(())
            }
            _ => self.parse_expr_operator(),
        }
    }

    fn parse_expr_number(&mut self) {
        let mut allowdot = true;
        self.tstart = self.pos;
        self.tline = self.line;
        if self.cur() == b'-' {
            self.pos += 1;
        }
        while self.cur().is_ascii_digit() || (allowdot && self.cur() == b'.') {
            if self.cur() == b'.' {
                allowdot = false;
            }
            self.pos += 1;
            if !allowdot && self.cur() == b'e' && self.peek(1) == b'-' {
                self.pos += 2;
            }
        }
        self.tend = self.pos;
        self.tt = TokenKind::ExprNumber;
    }

    fn parse_expr_operator(&mut self) -> Result<(), ()> {
        let rest = &self.text[self.pos.min(self.text.len())..];
        let mut best_len = 0;
        for op in operators() {
            if op.name.len() > best_len && rest.starts_with(op.name) {
                best_len = op.name.len();
            }
        }
        if best_len == 0 {
            return Err(());
        }
        self.tstart = self.pos;
        self.tend = self.pos + best_len;
        self.pos += best_len;
        self.tline = self.line;
        self.tt = TokenKind::ExprOperator;
        Ok(())
    }
}

fn xdigit(c: char) -> Option<u32> {
    c.to_digit(16)
}

fn odigit(c: char) -> Option<u32> {
    c.to_digit(8)
}

/// Apply backslash-escape conversion to `s`. Recognized escapes are the
/// single-character controls, `\xHH` with one or two hex digits and octal
/// sequences of up to three digits; any other escaped character stands for
/// itself.
pub fn escape(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\\' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match chars.get(i + 1).copied() {
            None => {
                out.push('\\');
                i += 1;
            }
            Some('a') => {
                out.push('\x07');
                i += 2;
            }
            Some('b') => {
                out.push('\x08');
                i += 2;
            }
            Some('f') => {
                out.push('\x0c');
                i += 2;
            }
            Some('n') => {
                out.push('\n');
                i += 2;
            }
            Some('r') => {
                out.push('\r');
                i += 2;
            }
            Some('t') => {
                out.push('\t');
                i += 2;
            }
            Some('v') => {
                out.push('\x0b');
                i += 2;
            }
            Some('x') => {
                match chars.get(i + 2).copied().and_then(xdigit) {
                    None => {
                        // Not a hex escape after all; the 'x' stands alone.
                        out.push('x');
                        i += 2;
                    }
                    Some(first) => {
                        match chars.get(i + 3).copied().and_then(xdigit) {
                            None => {
                                out.push(char::from(first as u8));
                                i += 3;
                            }
                            Some(second) => {
                                out.push(char::from((first * 16 + second) as u8));
                                i += 4;
                            }
                        }
                    }
                }
            }
            Some(c @ '0'..='7') => {
                let mut val = odigit(c).unwrap_or(0);
                let mut used = 2;
                if let Some(d) = chars.get(i + 2).copied().and_then(odigit) {
                    val = val * 8 + d;
                    used = 3;
                    if let Some(d) = chars.get(i + 3).copied().and_then(odigit) {
                        val = val * 8 + d;
                        used = 4;
                    }
                }
                out.push(char::from(val as u8));
                i += used;
            }
            Some(other) => {
                out.push(other);
                i += 2;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect `(kind, decoded text)` for every script token in `src`.
    fn script_tokens(src: &str) -> Vec<(TokenKind, String)> {
        let mut p = Parser::new(src, 1);
        let mut out = Vec::new();
        while !p.eof() {
            p.parse_script_token();
            let (text, kind, _) = p.token();
            out.push((kind, text));
        }
        out
    }

    fn list_tokens(src: &str) -> Vec<(TokenKind, String)> {
        let mut p = Parser::new(src, 1);
        let mut out = Vec::new();
        while !p.eof() {
            p.parse_list_token();
            let (text, kind, _) = p.token();
            out.push((kind, text));
        }
        out
    }

    fn expr_tokens(src: &str) -> Vec<(TokenKind, String)> {
        let mut p = Parser::new(src, 1);
        let mut out = Vec::new();
        while !p.eof() {
            p.parse_expr_token().expect("expression tokenizes");
            let (text, kind, _) = p.token();
            out.push((kind, text));
        }
        out
    }

    use TokenKind::*;

    #[test]
    fn test_script_tokenization() {
        let cases: Vec<(&str, Vec<(TokenKind, &str)>)> = vec![
            (
                "puts hello",
                vec![(Esc, "puts"), (Sep, " "), (Esc, "hello"), (Eol, "")],
            ),
            (
                "set x $y\n",
                vec![
                    (Esc, "set"),
                    (Sep, " "),
                    (Esc, "x"),
                    (Sep, " "),
                    (Var, "y"),
                    (Eol, "\n"),
                ],
            ),
            // A word glued from several tokens.
            (
                "set $i $x$y [foo]BAR",
                vec![
                    (Esc, "set"),
                    (Sep, " "),
                    (Var, "i"),
                    (Sep, " "),
                    (Var, "x"),
                    (Var, "y"),
                    (Sep, " "),
                    (Cmd, "foo"),
                    (Esc, "BAR"),
                    (Eol, ""),
                ],
            ),
            // Braces keep their content literal.
            (
                "if {$a == 1} {puts one}",
                vec![
                    (Esc, "if"),
                    (Sep, " "),
                    (Str, "$a == 1"),
                    (Sep, " "),
                    (Str, "puts one"),
                    (Eol, ""),
                ],
            ),
            // Nested brackets stay inside one Cmd token.
            (
                "set x [lindex [list a b] 0]",
                vec![
                    (Esc, "set"),
                    (Sep, " "),
                    (Esc, "x"),
                    (Sep, " "),
                    (Cmd, "lindex [list a b] 0"),
                    (Eol, ""),
                ],
            ),
            // Dictionary sugar.
            (
                "puts $a(k)",
                vec![(Esc, "puts"), (Sep, " "), (DictSugar, "a(k)"), (Eol, "")],
            ),
            // Braced variable name.
            (
                "puts ${a b}",
                vec![(Esc, "puts"), (Sep, " "), (Var, "a b"), (Eol, "")],
            ),
            // A '$' with no name following is a plain string.
            ("puts $", vec![(Esc, "puts"), (Sep, " "), (Str, "$"), (Eol, "")]),
            // Comments only start where a command could.
            (
                "# a comment\nputs x#y",
                vec![(Esc, "puts"), (Sep, " "), (Esc, "x#y"), (Eol, "")],
            ),
            // Quotes allow embedded substitution and whitespace.
            (
                "puts \"a $b c\"",
                vec![
                    (Esc, "puts"),
                    (Sep, " "),
                    (Esc, "a "),
                    (Var, "b"),
                    (Esc, " c"),
                    (Eol, ""),
                ],
            ),
            // Semicolons separate commands like newlines.
            (
                "a; b",
                vec![(Esc, "a"), (Eol, "; "), (Esc, "b"), (Eol, "")],
            ),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let got = script_tokens(src);
            let want: Vec<(TokenKind, String)> = expected
                .iter()
                .map(|(k, s)| (*k, s.to_string()))
                .collect();
            assert_eq!(got, want, "script case #{} failed for {:?}", i + 1, src);
        }
    }

    #[test]
    fn test_script_escapes() {
        assert_eq!(
            script_tokens("puts a\\tb"),
            vec![
                (Esc, "puts".into()),
                (Sep, " ".into()),
                (Esc, "a\tb".into()),
                (Eol, "".into()),
            ]
        );
        // Backslash-newline is a word separator.
        assert_eq!(
            script_tokens("a \\\n b"),
            vec![
                (Esc, "a".into()),
                (Sep, " \\\n ".into()),
                (Esc, "b".into()),
                (Eol, "".into()),
            ]
        );
    }

    #[test]
    fn test_line_numbers() {
        let mut p = Parser::new("a\nb\nc", 1);
        let mut lines = Vec::new();
        while !p.eof() {
            p.parse_script_token();
            if p.token_kind() == Esc {
                lines.push(p.token_line());
            }
        }
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_list_tokenization() {
        let cases: Vec<(&str, Vec<(TokenKind, &str)>)> = vec![
            (
                "a b c",
                vec![
                    (Esc, "a"),
                    (Sep, " "),
                    (Esc, "b"),
                    (Sep, " "),
                    (Esc, "c"),
                    (Eol, ""),
                ],
            ),
            ("a {b c}", vec![(Esc, "a"), (Sep, " "), (Str, "b c"), (Eol, "")]),
            // No '$' or '[' activity in lists.
            ("$a [b]", vec![(Esc, "$a"), (Sep, " "), (Esc, "[b]"), (Eol, "")]),
            (
                "\"a b\" c",
                vec![(Esc, "a b"), (Sep, " "), (Esc, "c"), (Eol, "")],
            ),
            ("{a {b c}}", vec![(Str, "a {b c}"), (Eol, "")]),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let got = list_tokens(src);
            let want: Vec<(TokenKind, String)> = expected
                .iter()
                .map(|(k, s)| (*k, s.to_string()))
                .collect();
            assert_eq!(got, want, "list case #{} failed for {:?}", i + 1, src);
        }
    }

    #[test]
    fn test_expression_tokenization() {
        let cases: Vec<(&str, Vec<(TokenKind, &str)>)> = vec![
            (
                "1+2",
                vec![
                    (ExprNumber, "1"),
                    (ExprOperator, "+"),
                    (ExprNumber, "2"),
                    (Eol, ""),
                ],
            ),
            (
                "(1+2)*3",
                vec![
                    (SubexprStart, "("),
                    (ExprNumber, "1"),
                    (ExprOperator, "+"),
                    (ExprNumber, "2"),
                    (SubexprEnd, ")"),
                    (ExprOperator, "*"),
                    (ExprNumber, "3"),
                    (Eol, ""),
                ],
            ),
            // Longest match: "<<<" is the rotate, not "<<" then "<".
            (
                "1<<<2",
                vec![
                    (ExprNumber, "1"),
                    (ExprOperator, "<<<"),
                    (ExprNumber, "2"),
                    (Eol, ""),
                ],
            ),
            // A leading minus on a number literal is part of the number.
            (
                "-5 + $x",
                vec![
                    (ExprNumber, "-5"),
                    (ExprOperator, "+"),
                    (Var, "x"),
                    (Eol, ""),
                ],
            ),
            (
                "[foo] eq \"bar\"",
                vec![
                    (Cmd, "foo"),
                    (ExprOperator, "eq"),
                    (Esc, "bar"),
                    (Eol, ""),
                ],
            ),
            (
                "1.5/2",
                vec![
                    (ExprNumber, "1.5"),
                    (ExprOperator, "/"),
                    (ExprNumber, "2"),
                    (Eol, ""),
                ],
            ),
            (
                "$a(k) == 1",
                vec![
                    (DictSugar, "a(k)"),
                    (ExprOperator, "=="),
                    (ExprNumber, "1"),
                    (Eol, ""),
                ],
            ),
        ];
        for (i, (src, expected)) in cases.iter().enumerate() {
            let got = expr_tokens(src);
            let want: Vec<(TokenKind, String)> = expected
                .iter()
                .map(|(k, s)| (*k, s.to_string()))
                .collect();
            assert_eq!(got, want, "expr case #{} failed for {:?}", i + 1, src);
        }
    }

    #[test]
    fn test_expression_rejects_unknown_operator() {
        let mut p = Parser::new("1 @ 2", 1);
        assert!(p.parse_expr_token().is_ok()); // 1
        assert!(p.parse_expr_token().is_err()); // @
    }

    #[test]
    fn test_subst_tokenization() {
        let collect = |src: &str, flags: u32| {
            let mut p = Parser::new(src, 1);
            let mut out = Vec::new();
            while !p.eof() {
                p.parse_subst_token(flags);
                let (text, kind, _) = p.token();
                out.push((kind, text));
            }
            out
        };
        assert_eq!(
            collect("a $b [c] d", 0),
            vec![
                (Esc, "a ".into()),
                (Var, "b".into()),
                (Esc, " ".into()),
                (Cmd, "c".into()),
                (Esc, " d".into()),
                (Eol, "".into()),
            ]
        );
        // With commands disabled the brackets stay literal text.
        assert_eq!(
            collect("a [c] b", SUBST_NOCMD),
            vec![
                (Esc, "a ".into()),
                (Esc, "[c]".into()),
                (Esc, " b".into()),
                (Eol, "".into()),
            ]
        );
        // With variables disabled the dollar stays literal text.
        assert_eq!(
            collect("a $b c", SUBST_NOVAR),
            vec![
                (Esc, "a ".into()),
                (Esc, "$b".into()),
                (Esc, " c".into()),
                (Eol, "".into()),
            ]
        );
    }

    #[test]
    fn test_escape_conversion() {
        let cases = vec![
            ("plain", "plain"),
            ("a\\tb", "a\tb"),
            ("a\\nb", "a\nb"),
            ("\\x41", "A"),
            ("\\x4", "\x04"),
            ("\\xZ", "xZ"),
            ("\\101", "A"),
            ("\\7", "\x07"),
            ("\\18", "\x018"),
            ("\\q", "q"),
            ("end\\", "end\\"),
            ("\\x41\\x42C", "ABC"),
        ];
        for (i, (src, want)) in cases.iter().enumerate() {
            assert_eq!(&escape(src), want, "escape case #{} for {:?}", i + 1, src);
        }
        // The decoded form never grows.
        for (src, _) in cases {
            assert!(escape(src).len() <= src.len());
        }
    }
}
