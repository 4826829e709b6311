//! Lexer and macro expander for the instruction-selection DSL.
//!
//! Tokens are whitespace-separated: numbers (decimal, `0b`, `0o`, `0x`),
//! identifiers, registers (`%name`), instruction names (UPPERCASE), macro
//! names (`#name`), parentheses, comma, dot and pipe. Macro expansion is
//! lexically interleaved with normal lexing through a stack of expansion
//! frames; while a macro definition is being read the lexer is in raw mode
//! and captures body tokens verbatim instead of expanding them.

use crate::isel::{IselError, IselResult};

/// The location of a token or error: a 1-based line number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    /// 1-based line number in the table source.
    pub line: usize,
}

/// The keywords of the DSL.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    /// `match`
    Match,
    /// `where`
    Where,
    /// `with`
    With,
    /// `commutative`
    Commutative,
    /// `reg`
    Reg,
    /// `imm`
    Imm,
    /// `name`
    Name,
    /// `block`
    Block,
    /// `result`
    Result,
    /// `clobber`
    Clobber,
    /// `out`
    Out,
    /// `is`
    Is,
    /// `eq`
    Eq,
    /// `ne`
    Ne,
    /// `lt`
    Lt,
    /// `gt`
    Gt,
    /// `le`
    Le,
    /// `ge`
    Ge,
    /// `discard`
    Discard,
    /// `any`
    Any,
    /// `emit`
    Emit,
    /// `macro`
    Macro,
    /// `undef`
    Undef,
    /// `expands`
    Expands,
    /// `endmacro`
    Endmacro,
    /// `for`
    For,
    /// `do`
    Do,
    /// `endfor`
    Endfor,
}

/// All keywords with their spellings.
const KEYWORDS: [(&str, Keyword); 28] = [
    ("match", Keyword::Match),
    ("where", Keyword::Where),
    ("with", Keyword::With),
    ("commutative", Keyword::Commutative),
    ("reg", Keyword::Reg),
    ("imm", Keyword::Imm),
    ("name", Keyword::Name),
    ("block", Keyword::Block),
    ("result", Keyword::Result),
    ("clobber", Keyword::Clobber),
    ("out", Keyword::Out),
    ("is", Keyword::Is),
    ("eq", Keyword::Eq),
    ("ne", Keyword::Ne),
    ("lt", Keyword::Lt),
    ("gt", Keyword::Gt),
    ("le", Keyword::Le),
    ("ge", Keyword::Ge),
    ("discard", Keyword::Discard),
    ("any", Keyword::Any),
    ("emit", Keyword::Emit),
    ("macro", Keyword::Macro),
    ("undef", Keyword::Undef),
    ("expands", Keyword::Expands),
    ("endmacro", Keyword::Endmacro),
    ("for", Keyword::For),
    ("do", Keyword::Do),
    ("endfor", Keyword::Endfor),
];

/// A DSL token.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// End of input.
    Eof,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `|`
    Pipe,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// A number literal.
    Number(u64),
    /// A lower-case identifier that is not a keyword.
    Ident(String),
    /// A register mnemonic including its `%` prefix.
    Register(String),
    /// An UPPERCASE instruction mnemonic.
    Instruction(String),
    /// A `#name` macro name (or a bare `#` inside a for loop).
    MacroName(String),
    /// `i<N>`: the N-th matched instruction.
    IName(u64),
    /// `o<N>`: the N-th matched operand.
    OName(u64),
    /// `o*`: any remaining operands.
    OStar,
    /// A keyword.
    Keyword(Keyword),
}

#[derive(Clone)]
struct MacroDef {
    name: String,
    location: Location,
    is_for_loop: bool,
    params: Vec<Token>,
    expansion: Vec<(Token, Location)>,
}

struct Expansion {
    mac: MacroDef,
    token_index: usize,
    for_index: usize,
    args: Vec<Token>,
}

/// The DSL lexer, including the macro table and expansion stack.
pub struct Lexer<'a> {
    filename: String,
    src: &'a [u8],
    pos: usize,
    line: usize,

    macros: Vec<MacroDef>,
    expansion_stack: Vec<Expansion>,
    raw_mode: bool,

    /// The current token.
    pub tok: Token,
    /// The location of the current token.
    pub loc: Location,
}

fn is_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `source` and read the first token.
    pub fn new(filename: &str, source: &'a str) -> IselResult<Self> {
        let mut lexer = Self {
            filename: filename.to_string(),
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            macros: Vec::new(),
            expansion_stack: Vec::new(),
            raw_mode: false,
            tok: Token::Eof,
            loc: Location { line: 1 },
        };
        lexer.next_token()?;
        Ok(lexer)
    }

    /// Raise an error at the current location, attaching the expansion
    /// stack as notes.
    pub fn error(&self, message: impl Into<String>) -> IselError {
        self.error_at(self.loc, message)
    }

    /// Raise an error at `loc`.
    pub fn error_at(&self, loc: Location, message: impl Into<String>) -> IselError {
        IselError {
            filename: self.filename.clone(),
            location: loc,
            message: message.into(),
            expansion_notes: self
                .expansion_stack
                .iter()
                .rev()
                .map(|e| (e.mac.name.clone(), e.mac.location))
                .collect(),
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        if c != 0 {
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
            }
        }
        c
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b';' => {
                    while self.peek() != b'\n' && self.peek() != 0 {
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn read_while(&mut self, first: u8, cond: fn(u8) -> bool) -> String {
        let mut text = String::new();
        text.push(first as char);
        while cond(self.peek()) && self.peek() != 0 {
            text.push(self.bump() as char);
        }
        text
    }

    fn read_number(&mut self, first: u8) -> IselResult<u64> {
        let text = self.read_while(first, |c| c.is_ascii_alphanumeric());
        let (digits, radix) = if let Some(rest) = text.strip_prefix("0x") {
            (rest, 16)
        } else if let Some(rest) = text.strip_prefix("0o") {
            (rest, 8)
        } else if let Some(rest) = text.strip_prefix("0b") {
            (rest, 2)
        } else {
            (text.as_str(), 10)
        };
        u64::from_str_radix(digits, radix)
            .map_err(|_| self.error(format!("invalid integer literal '{text}'")))
    }

    /// Advance to the next token.
    pub fn next_token(&mut self) -> IselResult<()> {
        loop {
            // Pop a token off the expansion stack if we have one.
            if !self.expansion_stack.is_empty() {
                let finished = {
                    let frame = self.expansion_stack.last_mut().unwrap();
                    if frame.token_index == frame.mac.expansion.len() {
                        // A for loop with values left rewinds and emits its
                        // body again; anything else is done.
                        if frame.mac.is_for_loop && frame.for_index + 1 < frame.mac.params.len()
                        {
                            frame.for_index += 1;
                            frame.token_index = 0;
                            false
                        } else {
                            true
                        }
                    } else {
                        false
                    }
                };
                if finished {
                    self.expansion_stack.pop();
                    continue;
                }

                let (tok, loc) = {
                    let frame = self.expansion_stack.last_mut().unwrap();
                    let entry = frame.mac.expansion[frame.token_index].clone();
                    frame.token_index += 1;
                    entry
                };

                if let Token::MacroName(name) = &tok {
                    if !self.raw_mode {
                        let name = name.clone();
                        if self.substitute_macro_token(&name, loc)? {
                            return Ok(());
                        }
                        continue;
                    }
                }
                self.tok = tok;
                self.loc = loc;
                return Ok(());
            }

            self.skip_whitespace();
            self.loc = Location { line: self.line };
            let c = self.bump();
            match c {
                0 => {
                    self.tok = Token::Eof;
                    return Ok(());
                }
                b',' => {
                    self.tok = Token::Comma;
                    return Ok(());
                }
                b'.' => {
                    self.tok = Token::Dot;
                    return Ok(());
                }
                b'|' => {
                    self.tok = Token::Pipe;
                    return Ok(());
                }
                b'(' => {
                    self.tok = Token::LParen;
                    return Ok(());
                }
                b')' => {
                    self.tok = Token::RParen;
                    return Ok(());
                }

                b'#' => {
                    let name = self.read_while(b'#', is_continue);
                    if self.raw_mode {
                        self.tok = Token::MacroName(name);
                        return Ok(());
                    }
                    let loc = self.loc;
                    if self.substitute_macro_token(&name, loc)? {
                        return Ok(());
                    }
                    continue;
                }

                b'%' => {
                    let name = self.read_while(b'%', is_continue);
                    self.tok = Token::Register(name);
                    return Ok(());
                }

                c if c.is_ascii_digit() => {
                    let n = self.read_number(c)?;
                    self.tok = Token::Number(n);
                    return Ok(());
                }

                c if c.is_ascii_uppercase() => {
                    let text = self.read_while(c, |c| c.is_ascii_alphanumeric());
                    self.tok = Token::Instruction(text);
                    return Ok(());
                }

                c if is_start(c) => {
                    let text = self.read_while(c, is_continue);

                    if let Some(&(_, kw)) = KEYWORDS.iter().find(|(s, _)| *s == text) {
                        if !self.raw_mode {
                            match kw {
                                Keyword::Macro => {
                                    self.raw_mode = true;
                                    self.lex_macro_def()?;
                                    self.raw_mode = false;
                                    continue;
                                }
                                Keyword::Undef => {
                                    self.raw_mode = true;
                                    self.lex_macro_undef()?;
                                    self.raw_mode = false;
                                    continue;
                                }
                                Keyword::For => {
                                    self.raw_mode = true;
                                    self.lex_for_expansion()?;
                                    self.raw_mode = false;
                                    continue;
                                }
                                _ => {}
                            }
                        }
                        self.tok = Token::Keyword(kw);
                        return Ok(());
                    }

                    // `i<N>` and `o<N>` / `o*` instruction and operand names.
                    if let Some(digits) = text.strip_prefix('i') {
                        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                            self.tok = Token::IName(digits.parse().unwrap());
                            return Ok(());
                        }
                    }
                    if text == "o" && self.peek() == b'*' {
                        self.bump();
                        self.tok = Token::OStar;
                        return Ok(());
                    }
                    if let Some(digits) = text.strip_prefix('o') {
                        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                            self.tok = Token::OName(digits.parse().unwrap());
                            return Ok(());
                        }
                    }

                    self.tok = Token::Ident(text);
                    return Ok(());
                }

                c => {
                    return Err(self.error(format!("unexpected character '{}'", c as char)));
                }
            }
        }
    }

    /// Handle a macro-name token in expanding position. Returns `true` when
    /// a token was produced, `false` when an expansion frame was pushed and
    /// the caller should continue lexing.
    fn substitute_macro_token(&mut self, name: &str, loc: Location) -> IselResult<bool> {
        // A bare '#' yields the current value of the innermost for loop.
        if name == "#" {
            let frame = self
                .expansion_stack
                .iter()
                .rev()
                .find(|f| f.mac.is_for_loop)
                .ok_or_else(|| self.error_at(loc, "cannot use '#' outside of a for loop expansion"))?;
            self.tok = frame.mac.params[frame.for_index].clone();
            self.loc = loc;
            return Ok(true);
        }

        // This may be an argument of the currently expanding macro. An
        // argument that is itself a macro name (a bare '#' passed through a
        // for loop, say) resolves again at the point of use.
        if let Some(frame) = self.expansion_stack.last() {
            if let Some(idx) = frame
                .mac
                .params
                .iter()
                .position(|p| matches!(p, Token::MacroName(n) if n == name))
            {
                let arg = frame.args[idx].clone();
                if let Token::MacroName(inner) = &arg {
                    let inner = inner.clone();
                    return self.substitute_macro_token(&inner, loc);
                }
                self.tok = arg;
                self.loc = loc;
                return Ok(true);
            }
        }

        // Otherwise it is an invocation.
        let mac = self
            .macros
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| self.error_at(loc, format!("unknown macro '{name}'")))?;

        // Read the arguments in raw mode so they are captured verbatim.
        let mut args = Vec::new();
        self.raw_mode = true;
        for i in 0..mac.params.len() {
            self.next_token()?;
            if self.tok == Token::Eof {
                self.raw_mode = false;
                return Err(self.error_at(
                    loc,
                    format!("macro invocation '{name}' terminated by end of file"),
                ));
            }
            args.push(self.tok.clone());
            if i + 1 < mac.params.len() {
                self.next_token()?;
                if self.tok != Token::Comma {
                    self.raw_mode = false;
                    return Err(self
                        .error_at(loc, format!("macro invocation '{name}' has too few arguments")));
                }
            }
        }
        self.raw_mode = false;

        self.expansion_stack.push(Expansion {
            mac,
            token_index: 0,
            for_index: 0,
            args,
        });
        Ok(false)
    }

    /// `macro NAME #arg1 #arg2 … expands … endmacro`
    fn lex_macro_def(&mut self) -> IselResult<()> {
        self.next_token()?;

        let (name, location) = match &self.tok {
            Token::MacroName(n) => (n.clone(), self.loc),
            _ => return Err(self.error("expected macro name")),
        };
        if self.macros.iter().any(|m| m.name == name) {
            return Err(self.error(format!("macro '{name}' already defined")));
        }

        let mut mac = MacroDef {
            name,
            location,
            is_for_loop: false,
            params: Vec::new(),
            expansion: Vec::new(),
        };
        self.next_token()?;

        // Parameters up to the "expands" keyword. They must start with '#'
        // and contain at least one more character.
        while self.tok != Token::Keyword(Keyword::Expands) && self.tok != Token::Eof {
            match &self.tok {
                Token::MacroName(n) if n.len() >= 2 => mac.params.push(self.tok.clone()),
                _ => return Err(self.error("expected macro argument")),
            }
            self.next_token()?;
        }
        if self.tok != Token::Keyword(Keyword::Expands) {
            return Err(self.error("macro definition terminated by end of file"));
        }
        self.next_token()?;

        // The expansion body.
        while self.tok != Token::Keyword(Keyword::Endmacro) && self.tok != Token::Eof {
            mac.expansion.push((self.tok.clone(), self.loc));
            self.next_token()?;
        }
        if self.tok != Token::Keyword(Keyword::Endmacro) {
            return Err(self.error("macro definition terminated by end of file"));
        }

        self.macros.push(mac);
        Ok(())
    }

    /// `undef #NAME`
    fn lex_macro_undef(&mut self) -> IselResult<()> {
        self.next_token()?;
        let name = match &self.tok {
            Token::MacroName(n) => n.clone(),
            _ => return Err(self.error("expected macro name")),
        };
        match self.macros.iter().position(|m| m.name == name) {
            Some(idx) => {
                self.macros.swap_remove(idx);
            }
            None => return Err(self.error(format!("macro '{name}' not defined"))),
        }
        Ok(())
    }

    /// `for v1, v2, … do … endfor`
    fn lex_for_expansion(&mut self) -> IselResult<()> {
        self.next_token()?;

        let mut mac = MacroDef {
            name: "for".to_string(),
            location: self.loc,
            is_for_loop: true,
            params: Vec::new(),
            expansion: Vec::new(),
        };

        // The loop values.
        while self.tok != Token::Keyword(Keyword::Do) && self.tok != Token::Eof {
            if self.tok != Token::Comma {
                mac.params.push(self.tok.clone());
            }
            self.next_token()?;
        }
        if self.tok != Token::Keyword(Keyword::Do) {
            return Err(self.error("for loop terminated by end of file"));
        }
        if mac.params.is_empty() {
            return Err(self.error("for loop must have at least one value"));
        }
        self.next_token()?;

        // The loop body.
        while self.tok != Token::Keyword(Keyword::Endfor) && self.tok != Token::Eof {
            mac.expansion.push((self.tok.clone(), self.loc));
            self.next_token()?;
        }
        if self.tok != Token::Keyword(Keyword::Endfor) {
            return Err(self.error("for loop terminated by end of file"));
        }

        self.expansion_stack.push(Expansion {
            mac,
            token_index: 0,
            for_index: 0,
            args: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new("test.isel", src).unwrap();
        let mut out = Vec::new();
        while lexer.tok != Token::Eof {
            out.push(lexer.tok.clone());
            lexer.next_token().unwrap();
        }
        out
    }

    #[test]
    fn basic_tokens() {
        let toks = all_tokens("match i1 where i1 ADD with o1 reg, o2 imm eq 0x10 | 0b11 .");
        assert_eq!(
            toks,
            vec![
                Token::Keyword(Keyword::Match),
                Token::IName(1),
                Token::Keyword(Keyword::Where),
                Token::IName(1),
                Token::Instruction("ADD".to_string()),
                Token::Keyword(Keyword::With),
                Token::OName(1),
                Token::Keyword(Keyword::Reg),
                Token::Comma,
                Token::OName(2),
                Token::Keyword(Keyword::Imm),
                Token::Keyword(Keyword::Eq),
                Token::Number(16),
                Token::Pipe,
                Token::Number(3),
                Token::Dot,
            ]
        );
    }

    #[test]
    fn registers_and_ostar() {
        let toks = all_tokens("clobber %rax, %rdx out o* any");
        assert_eq!(
            toks,
            vec![
                Token::Keyword(Keyword::Clobber),
                Token::Register("%rax".to_string()),
                Token::Comma,
                Token::Register("%rdx".to_string()),
                Token::Keyword(Keyword::Out),
                Token::OStar,
                Token::Keyword(Keyword::Any),
            ]
        );
    }

    #[test]
    fn macro_expansion() {
        let toks = all_tokens(
            "macro #M #a expands emit MOV #a, result endmacro #M 42",
        );
        assert_eq!(
            toks,
            vec![
                Token::Keyword(Keyword::Emit),
                Token::Instruction("MOV".to_string()),
                Token::Number(42),
                Token::Comma,
                Token::Keyword(Keyword::Result),
            ]
        );
    }

    #[test]
    fn for_loop_expansion() {
        let toks = all_tokens("for ADD, SUB do emit # endfor");
        assert_eq!(
            toks,
            vec![
                Token::Keyword(Keyword::Emit),
                Token::Instruction("ADD".to_string()),
                Token::Keyword(Keyword::Emit),
                Token::Instruction("SUB".to_string()),
            ]
        );
    }

    #[test]
    fn undef_removes() {
        let mut lexer = Lexer::new(
            "t",
            "macro #M expands emit endmacro undef #M #M",
        )
        .unwrap();
        // The body of M is empty of arguments; after undef, the invocation
        // must fail.
        let mut err = None;
        loop {
            match lexer.next_token() {
                Err(e) => {
                    err = Some(e);
                    break;
                }
                Ok(()) if lexer.tok == Token::Eof => break,
                Ok(()) => {}
            }
        }
        let err = err.expect("expected an unknown-macro error");
        assert!(err.message.contains("unknown macro"));
    }
}
