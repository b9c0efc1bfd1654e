//! The recursive-descent grammar: lists, pipelines, compound commands,
//! redirects and heredocs, `[[ ]]` conditionals, case statements, functions
//! and coprocesses.
//!
//! `Parser` owns the single source cursor shared with the lexing methods in
//! [`crate::lexer`]. Nested sub-parses (command substitution, backticks,
//! process substitution, funsubs, arithmetic command substitution) construct
//! a fresh `Parser` over the extracted substring; the only cross-construct
//! mutable state is the pending-heredoc queue and the saved/restored flag
//! set.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{
    BraceGroup, Case, CasePattern, Command, CommandSubstitution, CondBinary, Coproc, For, ForArith,
    Function, HereDoc, If, List, Loop, Node, Operator, Pipeline, ProcessSubstitution, Redirect,
    Select, Subshell, Time, UnaryTest, Word,
};
use crate::ast::{ArithmeticCommand, ArithmeticExpansion, BinaryTest, ConditionalExpr};
use crate::canon;
use crate::error::ParseError;
use crate::lexer::{
    DolbraceState, ParserState, QuoteState, TokenCache, TokenKind, WordContext,
    is_negation_boundary, is_redirect_char, MP_ARITH, MP_NONE,
};

/// Options controlling parsing.
#[derive(Clone, Debug, bon::Builder)]
pub struct ParserOptions {
    /// Whether extended globbing patterns (`@(...)` and friends) are
    /// recognized.
    #[builder(default = true)]
    pub enable_extended_globbing: bool,
    /// Whether this parser is running over the body of a process
    /// substitution (changes a couple of closing-brace corner cases).
    #[builder(default = false)]
    pub in_process_substitution: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            enable_extended_globbing: true,
            in_process_substitution: false,
        }
    }
}

/// Saved lexing-relevant parser state, restored around nested sub-parses.
#[derive(Clone, Debug)]
struct SavedParserState {
    state: ParserState,
    dolbrace: DolbraceState,
    eof_token: Option<char>,
}

fn is_reserved_word(w: &str) -> bool {
    matches!(
        w,
        "case" | "coproc" | "do" | "done" | "elif" | "else" | "esac" | "fi" | "for" | "function"
            | "if" | "in" | "select" | "then" | "until" | "while"
    )
}

fn is_extra_reserved(w: &str) -> bool {
    matches!(w, "{" | "}" | "[[" | "]]" | "!" | "time")
}

fn is_compound_keyword(w: &str) -> bool {
    matches!(w, "case" | "for" | "if" | "select" | "until" | "while")
}

fn is_assignment_builtin(w: &str) -> bool {
    matches!(
        w,
        "alias" | "declare" | "eval" | "export" | "let" | "local" | "readonly" | "typeset"
    )
}

fn is_cond_unary_op(w: &str) -> bool {
    matches!(
        w,
        "-G" | "-L" | "-N" | "-O" | "-R" | "-S" | "-a" | "-b" | "-c" | "-d" | "-e" | "-f" | "-g"
            | "-h" | "-k" | "-n" | "-o" | "-p" | "-r" | "-s" | "-t" | "-u" | "-v" | "-w" | "-x"
            | "-z"
    )
}

fn is_cond_binary_op(w: &str) -> bool {
    matches!(
        w,
        "!=" | "-ef" | "-eq" | "-ge" | "-gt" | "-le" | "-lt" | "-ne" | "-nt" | "-ot" | "<" | "="
            | "==" | "=~" | ">"
    )
}

/// A recursive-descent parser for POSIX/bash shell syntax.
pub struct Parser {
    pub(crate) src: Vec<char>,
    pub(crate) pos: usize,
    pub(crate) len: usize,
    pub(crate) extglob: bool,
    pub(crate) in_process_sub: bool,
    pub(crate) state: ParserState,
    pub(crate) dolbrace: DolbraceState,
    pub(crate) eof_token: Option<char>,
    pub(crate) word_context: WordContext,
    pub(crate) at_command_start: bool,
    pub(crate) in_array_literal: bool,
    pub(crate) in_assign_builtin: bool,
    pub(crate) pending_heredocs: Vec<Rc<RefCell<HereDoc>>>,
    pub(crate) cmdsub_heredoc_end: Option<usize>,
    pub(crate) saw_newline_in_single_quote: bool,
    pub(crate) cache: Option<TokenCache>,
    pub(crate) quote: QuoteState,
    pub(crate) arith_src: Vec<char>,
    pub(crate) arith_pos: usize,
}

impl Parser {
    /// Creates a parser over `source` with the given options.
    pub fn new(source: &str, options: &ParserOptions) -> Self {
        Self::subparser(
            source,
            options.in_process_substitution,
            options.enable_extended_globbing,
        )
    }

    /// Creates a parser for a nested sub-parse.
    pub(crate) fn subparser(source: &str, in_process_sub: bool, extglob: bool) -> Self {
        let src: Vec<char> = source.chars().collect();
        let len = src.len();
        Self {
            src,
            pos: 0,
            len,
            extglob,
            in_process_sub,
            state: ParserState::default(),
            dolbrace: DolbraceState::None,
            eof_token: None,
            word_context: WordContext::Normal,
            at_command_start: false,
            in_array_literal: false,
            in_assign_builtin: false,
            pending_heredocs: Vec::new(),
            cmdsub_heredoc_end: None,
            saw_newline_in_single_quote: false,
            cache: None,
            quote: QuoteState::new(),
            arith_src: Vec::new(),
            arith_pos: 0,
        }
    }

    fn save_state(&self) -> SavedParserState {
        SavedParserState {
            state: self.state,
            dolbrace: self.dolbrace,
            eof_token: self.eof_token,
        }
    }

    fn restore_state(&mut self, saved: &SavedParserState) {
        self.state = saved.state;
        self.dolbrace = saved.dolbrace;
        self.eof_token = saved.eof_token;
    }

    /// Position of the upcoming token, for error reporting.
    fn token_pos(&mut self) -> usize {
        self.peek_token().map_or(self.pos, |t| t.pos)
    }

    // Token-level helpers.

    fn lex_is_command_terminator(&mut self) -> Result<bool, ParseError> {
        let tok = self.peek_token()?;
        Ok(matches!(
            tok.kind,
            TokenKind::Eof
                | TokenKind::Newline
                | TokenKind::Pipe
                | TokenKind::Semi
                | TokenKind::LParen
                | TokenKind::RParen
                | TokenKind::Amp
        ))
    }

    fn lex_peek_operator(&mut self) -> Result<Option<(TokenKind, String)>, ParseError> {
        let tok = self.peek_token()?;
        if tok.kind.is_operator() {
            Ok(Some((tok.kind, tok.value)))
        } else {
            Ok(None)
        }
    }

    fn lex_peek_reserved_word(&mut self) -> Result<Option<String>, ParseError> {
        let tok = self.peek_token()?;
        if tok.kind != TokenKind::Word {
            return Ok(None);
        }
        let mut word = tok.value;
        if word.ends_with("\\\n") {
            word.truncate(word.len() - 2);
        }
        if is_reserved_word(&word) || is_extra_reserved(&word) {
            Ok(Some(word))
        } else {
            Ok(None)
        }
    }

    fn lex_is_at_reserved_word(&mut self, word: &str) -> Result<bool, ParseError> {
        Ok(self.lex_peek_reserved_word()?.as_deref() == Some(word))
    }

    fn lex_consume_word(&mut self, expected: &str) -> Result<bool, ParseError> {
        let tok = self.peek_token()?;
        if tok.kind != TokenKind::Word {
            return Ok(false);
        }
        let mut word = tok.value;
        if word.ends_with("\\\n") {
            word.truncate(word.len() - 2);
        }
        if word == expected {
            self.next_token()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn lex_peek_case_terminator(&mut self) -> Result<Option<&'static str>, ParseError> {
        let tok = self.peek_token()?;
        Ok(match tok.kind {
            TokenKind::SemiSemi => Some(";;"),
            TokenKind::SemiAmp => Some(";&"),
            TokenKind::SemiSemiAmp => Some(";;&"),
            _ => None,
        })
    }

    // Whitespace.

    pub(crate) fn skip_whitespace(&mut self) {
        while !self.at_end() {
            self.skip_blanks();
            if self.at_end() {
                break;
            }
            let ch = self.peek().unwrap_or('\0');
            if ch == '#' {
                if !self.skip_comment() {
                    break;
                }
            } else if ch == '\\' && self.peek_at(1) == Some('\n') {
                self.advance();
                self.advance();
            } else {
                break;
            }
        }
    }

    pub(crate) fn skip_whitespace_and_newlines(&mut self) {
        while !self.at_end() {
            let ch = self.peek().unwrap_or('\0');
            if canon::is_whitespace(ch) {
                self.advance();
                if ch == '\n' {
                    self.gather_heredoc_bodies();
                    if let Some(end) = self.cmdsub_heredoc_end {
                        if end > self.pos {
                            self.pos = end;
                            self.cmdsub_heredoc_end = None;
                        }
                    }
                }
            } else if ch == '#' {
                while !self.at_end() && !self.peek_is('\n') {
                    self.advance();
                }
            } else if ch == '\\' && self.peek_at(1) == Some('\n') {
                self.advance();
                self.advance();
            } else {
                break;
            }
        }
    }

    fn at_list_terminating_bracket(&self) -> bool {
        let Some(ch) = self.peek() else {
            return false;
        };
        if self.eof_token == Some(ch) {
            return true;
        }
        if ch == ')' {
            return true;
        }
        if ch == '}' {
            return self
                .peek_at(1)
                .map_or(true, crate::lexer::is_word_end_context);
        }
        false
    }

    fn at_eof_token(&mut self) -> Result<bool, ParseError> {
        match self.eof_token {
            None => Ok(false),
            Some(')') => Ok(self.peek_token()?.kind == TokenKind::RParen),
            Some('}') => {
                let tok = self.peek_token()?;
                Ok(tok.kind == TokenKind::Word && tok.value == "}")
            }
            Some(_) => Ok(false),
        }
    }

    fn collect_redirects(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut redirects = Vec::new();
        loop {
            self.skip_whitespace();
            match self.parse_redirect()? {
                Some(redirect) => redirects.push(redirect),
                None => break,
            }
        }
        Ok(redirects)
    }

    /// Parses a `do ... done` or `{ ... }` loop body.
    fn parse_loop_body(&mut self, context: &str) -> Result<Node, ParseError> {
        if self.peek_is('{') {
            let brace = self.parse_brace_group()?;
            let Some(Node::BraceGroup(bg)) = brace else {
                return Err(ParseError::at(
                    format!("Expected brace group body in {context}"),
                    self.token_pos(),
                ));
            };
            return Ok(*bg.body);
        }
        if self.lex_consume_word("do")? {
            let body = self.parse_list_until(&["done"])?;
            let Some(body) = body else {
                return Err(ParseError::at(
                    "Expected commands after 'do'",
                    self.token_pos(),
                ));
            };
            self.skip_whitespace_and_newlines();
            if !self.lex_consume_word("done")? {
                return Err(ParseError::at(
                    format!("Expected 'done' to close {context}"),
                    self.token_pos(),
                ));
            }
            return Ok(body);
        }
        Err(ParseError::at(
            format!("Expected 'do' or '{{' in {context}"),
            self.token_pos(),
        ))
    }

    /// Peeks the next unquoted word without consuming it.
    pub(crate) fn peek_word(&mut self) -> Option<String> {
        let saved_pos = self.pos;
        self.skip_whitespace();
        if self.at_end() || self.peek().is_some_and(canon::is_metachar) {
            self.pos = saved_pos;
            return None;
        }
        let mut chars = String::new();
        while let Some(ch) = self.peek() {
            if canon::is_metachar(ch) {
                break;
            }
            if matches!(ch, '\'' | '"') {
                break;
            }
            if ch == '\\' && self.peek_at(1) == Some('\n') {
                break;
            }
            if ch == '\\' && self.pos + 1 < self.len {
                chars.push(self.advance());
                chars.push(self.advance());
                continue;
            }
            chars.push(self.advance());
        }
        self.pos = saved_pos;
        (!chars.is_empty()).then_some(chars)
    }

    /// Consumes a specific word if it comes next. Inside a process
    /// substitution a leading `}` glued to the word is tolerated.
    pub(crate) fn consume_word(&mut self, expected: &str) -> bool {
        let saved_pos = self.pos;
        self.skip_whitespace();
        let Some(word) = self.peek_word() else {
            self.pos = saved_pos;
            return false;
        };
        let mut keyword_word = word.clone();
        let mut has_leading_brace = false;
        if self.in_process_sub && word.chars().count() > 1 && word.starts_with('}') {
            keyword_word = word.chars().skip(1).collect();
            has_leading_brace = true;
        }
        if keyword_word != expected {
            self.pos = saved_pos;
            return false;
        }
        self.skip_whitespace();
        if has_leading_brace {
            self.advance();
        }
        for _ in expected.chars() {
            self.advance();
        }
        while self.peek_is('\\') && self.peek_at(1) == Some('\n') {
            self.advance();
            self.advance();
        }
        true
    }

    /// Scans the interior of a double-quoted span, collecting expansions.
    pub(crate) fn scan_double_quote(
        &mut self,
        chars: &mut String,
        parts: &mut Vec<Node>,
        start: usize,
        handle_line_continuation: bool,
    ) -> Result<(), ParseError> {
        chars.push('"');
        while !self.at_end() && !self.peek_is('"') {
            let c = self.peek().unwrap_or('\0');
            if c == '\\' && self.pos + 1 < self.len {
                if handle_line_continuation && self.peek_at(1) == Some('\n') {
                    self.advance();
                    self.advance();
                } else {
                    chars.push(self.advance());
                    chars.push(self.advance());
                }
            } else if c == '$' {
                if !self.parse_dollar_expansion(chars, parts, true)? {
                    chars.push(self.advance());
                }
            } else {
                chars.push(self.advance());
            }
        }
        if self.at_end() {
            return Err(ParseError::at("Unterminated double quote", start));
        }
        chars.push(self.advance());
        Ok(())
    }

    /// Dispatches a `$`-introduced expansion: arithmetic, deprecated
    /// arithmetic, command substitution, or parameter expansion. Returns
    /// false (consuming nothing) when none applies.
    pub(crate) fn parse_dollar_expansion(
        &mut self,
        chars: &mut String,
        parts: &mut Vec<Node>,
        in_dquote: bool,
    ) -> Result<bool, ParseError> {
        if self.pos + 2 < self.len
            && self.peek_at(1) == Some('(')
            && self.peek_at(2) == Some('(')
        {
            let (node, text) = self.parse_arithmetic_expansion()?;
            if let Some(node) = node {
                parts.push(node);
                chars.push_str(&text);
                return Ok(true);
            }
            let (node, text) = self.parse_command_substitution()?;
            if let Some(node) = node {
                parts.push(node);
                chars.push_str(&text);
                return Ok(true);
            }
            return Ok(false);
        }
        if self.peek_at(1) == Some('[') {
            let (node, text) = self.parse_deprecated_arithmetic()?;
            if let Some(node) = node {
                parts.push(node);
                chars.push_str(&text);
                return Ok(true);
            }
            return Ok(false);
        }
        if self.peek_at(1) == Some('(') {
            let (node, text) = self.parse_command_substitution()?;
            if let Some(node) = node {
                parts.push(node);
                chars.push_str(&text);
                return Ok(true);
            }
            return Ok(false);
        }
        let (node, text) = self.parse_param_expansion(in_dquote)?;
        if let Some(node) = node {
            parts.push(node);
            chars.push_str(&text);
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn parse_word_internal(
        &mut self,
        ctx: WordContext,
        at_command_start: bool,
        in_array_literal: bool,
    ) -> Result<Option<Word>, ParseError> {
        self.word_context = ctx;
        self.parse_word(at_command_start, in_array_literal, false)
    }

    /// Parses a word token, if one comes next.
    pub(crate) fn parse_word(
        &mut self,
        at_command_start: bool,
        in_array_literal: bool,
        in_assign_builtin: bool,
    ) -> Result<Option<Word>, ParseError> {
        self.skip_whitespace();
        if self.at_end() {
            return Ok(None);
        }
        self.at_command_start = at_command_start;
        self.in_array_literal = in_array_literal;
        self.in_assign_builtin = in_assign_builtin;
        let tok = self.peek_token();
        let result = match tok {
            Ok(tok) if tok.kind == TokenKind::Word => {
                self.next_token()?;
                Ok(tok.word)
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        };
        self.at_command_start = false;
        self.in_array_literal = false;
        self.in_assign_builtin = false;
        result
    }

    /// Parses a `$(...)` command substitution by re-entering the grammar
    /// with `)` as the end-of-input token. Backtracks on failure.
    pub(crate) fn parse_command_substitution(
        &mut self,
    ) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek_is('$') {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        self.advance();
        if !self.peek_is('(') {
            self.pos = start;
            return Ok((None, String::new()));
        }
        self.advance();
        let saved = self.save_state();
        self.state.set(ParserState::CMDSUBST);
        self.state.set(ParserState::EOFTOKEN);
        self.eof_token = Some(')');
        let cmd = self.parse_list(true)?.unwrap_or(Node::Empty);
        self.skip_whitespace_and_newlines();
        if !self.peek_is(')') {
            self.restore_state(&saved);
            self.pos = start;
            return Ok((None, String::new()));
        }
        self.advance();
        let text = self.slice(start, self.pos);
        self.restore_state(&saved);
        Ok((
            Some(Node::CommandSubstitution(CommandSubstitution {
                command: Box::new(cmd),
                brace: false,
            })),
            text,
        ))
    }

    /// Parses a brace command substitution `${ cmd; }` / `${|cmd; }`,
    /// entered from the braced-parameter reader. `start` is the `$`.
    pub(crate) fn parse_funsub(&mut self, start: usize) -> Result<(Option<Node>, String), ParseError> {
        if self.peek_is('|') {
            self.advance();
        }
        let saved = self.save_state();
        self.state.set(ParserState::CMDSUBST);
        self.state.set(ParserState::EOFTOKEN);
        self.eof_token = Some('}');
        let cmd = self.parse_list(true)?.unwrap_or(Node::Empty);
        self.skip_whitespace_and_newlines();
        if !self.peek_is('}') {
            self.restore_state(&saved);
            return Err(ParseError::unclosed("}", start));
        }
        self.advance();
        let text = self.slice(start, self.pos);
        self.restore_state(&saved);
        Ok((
            Some(Node::CommandSubstitution(CommandSubstitution {
                command: Box::new(cmd),
                brace: true,
            })),
            text,
        ))
    }

    pub(crate) fn is_assignment_word(word: &Word) -> bool {
        canon::assignment(&word.value, 0).is_some()
    }

    /// Parses a backtick command substitution, resolving `\$`, `` \` `` and
    /// `\\` escapes and collecting heredoc bodies that extend past the
    /// closing backtick.
    pub(crate) fn parse_backtick_substitution(
        &mut self,
    ) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek_is('`') {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        self.advance();
        let mut content = String::new();
        let mut text = String::from("`");
        let mut pending_heredocs: Vec<(String, bool)> = Vec::new();
        let mut in_heredoc_body = false;
        let mut current_delim = String::new();
        let mut current_strip = false;
        while !self.at_end() && (in_heredoc_body || !self.peek_is('`')) {
            if in_heredoc_body {
                let line_start = self.pos;
                let mut line_end = line_start;
                while line_end < self.len && self.src[line_end] != '\n' {
                    line_end += 1;
                }
                let line = self.slice(line_start, line_end);
                let check_line = if current_strip {
                    line.trim_start_matches('\t').to_string()
                } else {
                    line.clone()
                };
                if check_line == current_delim {
                    content.push_str(&line);
                    text.push_str(&line);
                    self.pos = line_end;
                    if self.peek_is('\n') {
                        content.push('\n');
                        text.push('\n');
                        self.advance();
                    }
                    in_heredoc_body = false;
                    if !pending_heredocs.is_empty() {
                        let (delim, strip) = pending_heredocs.remove(0);
                        current_delim = delim;
                        current_strip = strip;
                        in_heredoc_body = true;
                    }
                } else if check_line.starts_with(current_delim.as_str())
                    && check_line.chars().count() > current_delim.chars().count()
                {
                    let tabs_stripped = line.chars().count() - check_line.chars().count();
                    let end_pos = tabs_stripped + current_delim.chars().count();
                    let line_chars: Vec<char> = line.chars().collect();
                    for &c in &line_chars[..end_pos] {
                        content.push(c);
                        text.push(c);
                    }
                    self.pos = line_start + end_pos;
                    in_heredoc_body = false;
                    if !pending_heredocs.is_empty() {
                        let (delim, strip) = pending_heredocs.remove(0);
                        current_delim = delim;
                        current_strip = strip;
                        in_heredoc_body = true;
                    }
                } else {
                    content.push_str(&line);
                    text.push_str(&line);
                    self.pos = line_end;
                    if self.peek_is('\n') {
                        content.push('\n');
                        text.push('\n');
                        self.advance();
                    }
                }
                continue;
            }
            let c = self.peek().unwrap_or('\0');
            if c == '\\' && self.pos + 1 < self.len {
                let next_c = self.peek_at(1).unwrap_or('\0');
                if next_c == '\n' {
                    self.advance();
                    self.advance();
                } else if crate::lexer::is_escape_char_in_backtick(next_c) {
                    self.advance();
                    let escaped = self.advance();
                    content.push(escaped);
                    text.push('\\');
                    text.push(escaped);
                } else {
                    let ch = self.advance();
                    content.push(ch);
                    text.push(ch);
                }
                continue;
            }
            if c == '<' && self.peek_at(1) == Some('<') {
                if self.peek_at(2) == Some('<') {
                    // Here-string: pass the operator and its word through.
                    for _ in 0..3 {
                        let ch = self.advance();
                        content.push(ch);
                        text.push(ch);
                    }
                    while self.peek().is_some_and(canon::is_blank) {
                        let ch = self.advance();
                        content.push(ch);
                        text.push(ch);
                    }
                    while !self.at_end()
                        && !self.peek().is_some_and(canon::is_whitespace)
                        && !self.peek_is('(')
                        && !self.peek_is(')')
                    {
                        if self.peek_is('\\') && self.pos + 1 < self.len {
                            let ch = self.advance();
                            content.push(ch);
                            text.push(ch);
                            let ch = self.advance();
                            content.push(ch);
                            text.push(ch);
                        } else if self.peek_is('"') || self.peek_is('\'') {
                            let quote = self.peek().unwrap_or('\0');
                            let ch = self.advance();
                            content.push(ch);
                            text.push(ch);
                            while !self.at_end() && !self.peek_is(quote) {
                                if quote == '"' && self.peek_is('\\') {
                                    let ch = self.advance();
                                    content.push(ch);
                                    text.push(ch);
                                }
                                let ch = self.advance();
                                content.push(ch);
                                text.push(ch);
                            }
                            if !self.at_end() {
                                let ch = self.advance();
                                content.push(ch);
                                text.push(ch);
                            }
                        } else {
                            let ch = self.advance();
                            content.push(ch);
                            text.push(ch);
                        }
                    }
                    continue;
                }
                let ch = self.advance();
                content.push(ch);
                text.push(ch);
                let ch = self.advance();
                content.push(ch);
                text.push(ch);
                let mut strip_tabs = false;
                if self.peek_is('-') {
                    strip_tabs = true;
                    let ch = self.advance();
                    content.push(ch);
                    text.push(ch);
                }
                while self.peek().is_some_and(canon::is_blank) {
                    let ch = self.advance();
                    content.push(ch);
                    text.push(ch);
                }
                let mut delimiter = String::new();
                if let Some(ch) = self.peek() {
                    if matches!(ch, '"' | '\'') {
                        let quote = self.advance();
                        content.push(quote);
                        text.push(quote);
                        while !self.at_end() && !self.peek_is(quote) {
                            let dch = self.advance();
                            content.push(dch);
                            text.push(dch);
                            delimiter.push(dch);
                        }
                        if !self.at_end() {
                            let closing = self.advance();
                            content.push(closing);
                            text.push(closing);
                        }
                    } else if ch == '\\' {
                        let esc = self.advance();
                        content.push(esc);
                        text.push(esc);
                        if !self.at_end() {
                            let dch = self.advance();
                            content.push(dch);
                            text.push(dch);
                            delimiter.push(dch);
                        }
                        while !self.at_end() && !self.peek().is_some_and(canon::is_metachar) {
                            let dch = self.advance();
                            content.push(dch);
                            text.push(dch);
                            delimiter.push(dch);
                        }
                    } else {
                        while !self.at_end()
                            && !self.peek().is_some_and(canon::is_metachar)
                            && !self.peek_is('`')
                        {
                            let ch = self.peek().unwrap_or('\0');
                            if matches!(ch, '"' | '\'') {
                                let quote = self.advance();
                                content.push(quote);
                                text.push(quote);
                                while !self.at_end() && !self.peek_is(quote) {
                                    let dch = self.advance();
                                    content.push(dch);
                                    text.push(dch);
                                    delimiter.push(dch);
                                }
                                if !self.at_end() {
                                    let closing = self.advance();
                                    content.push(closing);
                                    text.push(closing);
                                }
                            } else if ch == '\\' {
                                let esc = self.advance();
                                content.push(esc);
                                text.push(esc);
                                if !self.at_end() {
                                    let dch = self.advance();
                                    content.push(dch);
                                    text.push(dch);
                                    delimiter.push(dch);
                                }
                            } else {
                                let dch = self.advance();
                                content.push(dch);
                                text.push(dch);
                                delimiter.push(dch);
                            }
                        }
                    }
                }
                if !delimiter.is_empty() {
                    pending_heredocs.push((delimiter, strip_tabs));
                }
                continue;
            }
            if c == '\n' {
                let ch = self.advance();
                content.push(ch);
                text.push(ch);
                if !pending_heredocs.is_empty() {
                    let (delim, strip) = pending_heredocs.remove(0);
                    current_delim = delim;
                    current_strip = strip;
                    in_heredoc_body = true;
                }
                continue;
            }
            let ch = self.advance();
            content.push(ch);
            text.push(ch);
        }
        if self.at_end() {
            return Err(ParseError::at("Unterminated backtick", start));
        }
        self.advance();
        text.push('`');
        // Heredoc tags still open at the closing backtick take their bodies
        // from the lines after the substitution.
        if !pending_heredocs.is_empty() {
            let (heredoc_start, heredoc_end) =
                canon::find_heredoc_content_end(&self.src, self.pos, &pending_heredocs);
            if heredoc_end > heredoc_start {
                content.push_str(&self.slice(heredoc_start, heredoc_end));
                match self.cmdsub_heredoc_end {
                    None => self.cmdsub_heredoc_end = Some(heredoc_end),
                    Some(prev) if heredoc_end > prev => {
                        self.cmdsub_heredoc_end = Some(heredoc_end);
                    }
                    Some(_) => {}
                }
            }
        }
        let mut sub = Self::subparser(&content, false, self.extglob);
        let cmd = sub.parse_list(true)?.unwrap_or(Node::Empty);
        Ok((
            Some(Node::CommandSubstitution(CommandSubstitution {
                command: Box::new(cmd),
                brace: false,
            })),
            text,
        ))
    }

    /// Parses a `<(...)` / `>(...)` process substitution. A failed
    /// speculative parse backtracks and yields the raw text instead.
    pub(crate) fn parse_process_substitution(
        &mut self,
    ) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek().is_some_and(is_redirect_char) {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        let direction = self.advance();
        if !self.peek_is('(') {
            self.pos = start;
            return Ok((None, String::new()));
        }
        self.advance();
        let saved = self.save_state();
        let old_in_process_sub = self.in_process_sub;
        self.in_process_sub = true;
        self.state.set(ParserState::EOFTOKEN);
        self.eof_token = Some(')');
        let attempt: Result<(Node, String), ParseError> = (|| {
            let cmd = self.parse_list(true)?.unwrap_or(Node::Empty);
            self.skip_whitespace_and_newlines();
            if !self.peek_is(')') {
                return Err(ParseError::at("Invalid process substitution", start));
            }
            self.advance();
            let text = self.slice(start, self.pos);
            let text = canon::strip_line_continuations_comment_aware(&text);
            Ok((
                Node::ProcessSubstitution(ProcessSubstitution {
                    direction,
                    command: Box::new(cmd),
                }),
                text,
            ))
        })();
        self.restore_state(&saved);
        self.in_process_sub = old_in_process_sub;
        if let Ok((node, text)) = attempt {
            return Ok((Some(node), text));
        }
        let content_start_char = self.src.get(start + 2).copied();
        if matches!(content_start_char, Some(' ' | '\t' | '\n')) {
            return Err(ParseError::at("Invalid process substitution", start));
        }
        self.pos = start + 2;
        self.parse_matched_pair('(', ')', MP_NONE, false)?;
        let text = self.slice(start, self.pos);
        let text = canon::strip_line_continuations_comment_aware(&text);
        Ok((None, text))
    }

    /// Parses an array literal `(word word ...)` after `name=`.
    pub(crate) fn parse_array_literal(&mut self) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek_is('(') {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        self.advance();
        self.state.set(ParserState::COMPASSIGN);
        let result = (|| {
            let mut elements: Vec<Word> = Vec::new();
            loop {
                self.skip_whitespace_and_newlines();
                if self.at_end() {
                    return Err(ParseError::at("Unterminated array literal", start));
                }
                if self.peek_is(')') {
                    break;
                }
                let word = self.parse_word(false, true, false)?;
                match word {
                    Some(word) => elements.push(word),
                    None => {
                        if self.peek_is(')') {
                            break;
                        }
                        return Err(ParseError::at("Expected word in array literal", self.pos));
                    }
                }
            }
            if !self.peek_is(')') {
                return Err(ParseError::at(
                    "Expected ) to close array literal",
                    self.pos,
                ));
            }
            self.advance();
            let text = self.slice(start, self.pos);
            Ok((Some(Node::Array(elements)), text))
        })();
        self.state.clear(ParserState::COMPASSIGN);
        result
    }

    /// Parses a `$(( ... ))` arithmetic expansion, falling back (for the
    /// caller to retry as command substitution) when no literal `))` closes
    /// it or its content fails to parse.
    pub(crate) fn parse_arithmetic_expansion(
        &mut self,
    ) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek_is('$') {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        if !(self.peek_at(1) == Some('(') && self.peek_at(2) == Some('(')) {
            return Ok((None, String::new()));
        }
        self.advance();
        self.advance();
        self.advance();
        let content_start = self.pos;
        let mut depth = 2isize;
        let mut first_close_pos: Option<usize> = None;
        while !self.at_end() && depth > 0 {
            let c = self.peek().unwrap_or('\0');
            if c == '\'' {
                self.advance();
                while !self.at_end() && !self.peek_is('\'') {
                    self.advance();
                }
                if !self.at_end() {
                    self.advance();
                }
            } else if c == '"' {
                self.advance();
                while !self.at_end() {
                    if self.peek_is('\\') && self.pos + 1 < self.len {
                        self.advance();
                        self.advance();
                    } else if self.peek_is('"') {
                        self.advance();
                        break;
                    } else {
                        self.advance();
                    }
                }
            } else if c == '\\' && self.pos + 1 < self.len {
                self.advance();
                self.advance();
            } else if c == '(' {
                depth += 1;
                self.advance();
            } else if c == ')' {
                if depth == 2 {
                    first_close_pos = Some(self.pos);
                }
                depth -= 1;
                if depth == 0 {
                    break;
                }
                self.advance();
            } else {
                if depth == 1 {
                    first_close_pos = None;
                }
                self.advance();
            }
        }
        if depth != 0 {
            if self.at_end() {
                return Err(ParseError::unclosed("))", start));
            }
            self.pos = start;
            return Ok((None, String::new()));
        }
        let content = match first_close_pos {
            Some(p) => self.slice(content_start, p),
            None => self.slice(content_start, self.pos),
        };
        self.advance();
        let text = self.slice(start, self.pos);
        match self.parse_arith_expr(&content) {
            Ok(expr) => Ok((
                Some(Node::ArithmeticExpansion(ArithmeticExpansion {
                    expression: expr.map(Box::new),
                })),
                text,
            )),
            Err(_) => {
                self.pos = start;
                Ok((None, String::new()))
            }
        }
    }

    /// Parses a deprecated `$[expr]` arithmetic expansion.
    pub(crate) fn parse_deprecated_arithmetic(
        &mut self,
    ) -> Result<(Option<Node>, String), ParseError> {
        if !self.peek_is('$') {
            return Ok((None, String::new()));
        }
        let start = self.pos;
        if self.peek_at(1) != Some('[') {
            return Ok((None, String::new()));
        }
        self.advance();
        self.advance();
        let content = self.parse_matched_pair('[', ']', MP_ARITH, false)?;
        let text = self.slice(start, self.pos);
        Ok((Some(Node::ArithDeprecated(content)), text))
    }

    pub(crate) fn parse_param_expansion(
        &mut self,
        in_dquote: bool,
    ) -> Result<(Option<Node>, String), ParseError> {
        self.read_param_expansion(in_dquote)
    }

    /// Parses a redirection, or backs off (returning `None`) when the text
    /// here is not a redirect after all.
    pub(crate) fn parse_redirect(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if self.at_end() {
            return Ok(None);
        }
        let start = self.pos;
        let mut fd: Option<u32> = None;
        let mut varfd: Option<String> = None;
        if self.peek_is('{') {
            let saved = self.pos;
            self.advance();
            let mut varname = String::new();
            let mut in_bracket = false;
            while !self.at_end() && !self.peek().is_some_and(is_redirect_char) {
                let ch = self.peek().unwrap_or('\0');
                if ch == '}' && !in_bracket {
                    break;
                } else if ch == '[' {
                    in_bracket = true;
                    varname.push(self.advance());
                } else if ch == ']' {
                    in_bracket = false;
                    varname.push(self.advance());
                } else if ch.is_alphanumeric() || ch == '_' {
                    varname.push(self.advance());
                } else if in_bracket && !canon::is_metachar(ch) {
                    varname.push(self.advance());
                } else {
                    break;
                }
            }
            let is_valid_varfd = {
                let first_ok = varname
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphabetic() || c == '_');
                if !first_ok {
                    false
                } else if varname.contains('[') || varname.contains(']') {
                    let left = varname.find('[');
                    let right = varname.rfind(']');
                    match (left, right) {
                        (Some(left), Some(right))
                            if right == varname.len() - 1 && right > left + 1 =>
                        {
                            let base = &varname[..left];
                            canon::is_valid_identifier(base)
                        }
                        _ => false,
                    }
                } else {
                    canon::is_valid_identifier(&varname)
                }
            };
            if self.peek_is('}') && is_valid_varfd {
                self.advance();
                varfd = Some(varname);
            } else {
                self.pos = saved;
            }
        }
        if varfd.is_none() && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            let mut fd_chars = String::new();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                fd_chars.push(self.advance());
            }
            fd = fd_chars.parse().ok();
        }
        let ch = self.peek();
        if ch == Some('&') && self.peek_at(1) == Some('>') {
            // `&>` never takes a leading fd; digits back off into a word.
            if fd.is_some() || varfd.is_some() {
                self.pos = start;
                return Ok(None);
            }
            self.advance();
            self.advance();
            let op = if self.peek_is('>') {
                self.advance();
                "&>>"
            } else {
                "&>"
            };
            self.skip_whitespace();
            let target = self.parse_word(false, false, false)?;
            let Some(target) = target else {
                return Err(ParseError::at(
                    format!("Expected target for redirect {op}"),
                    self.pos,
                ));
            };
            return Ok(Some(Node::Redirect(Redirect {
                op: op.to_string(),
                target,
            })));
        }
        let Some(first) = ch else {
            self.pos = start;
            return Ok(None);
        };
        if !is_redirect_char(first) {
            self.pos = start;
            return Ok(None);
        }
        if fd.is_none() && self.peek_at(1) == Some('(') {
            // Process substitution, not a redirect.
            self.pos = start;
            return Ok(None);
        }
        let mut op = self.advance().to_string();
        let mut strip_tabs = false;
        if let Some(next_ch) = self.peek() {
            if op == ">" && next_ch == '>' {
                self.advance();
                op = ">>".to_string();
            } else if op == "<" && next_ch == '<' {
                self.advance();
                if self.peek_is('<') {
                    self.advance();
                    op = "<<<".to_string();
                } else if self.peek_is('-') {
                    self.advance();
                    op = "<<".to_string();
                    strip_tabs = true;
                } else {
                    op = "<<".to_string();
                }
            } else if op == "<" && next_ch == '>' {
                self.advance();
                op = "<>".to_string();
            } else if op == ">" && next_ch == '|' {
                self.advance();
                op = ">|".to_string();
            } else if fd.is_none() && varfd.is_none() && op == ">" && next_ch == '&' {
                // `>&2` stays `>` with target `&2`; only a bare `>&` fuses.
                if !self
                    .peek_at(1)
                    .is_some_and(|c| c.is_ascii_digit() || c == '-')
                {
                    self.advance();
                    op = ">&".to_string();
                }
            } else if fd.is_none() && varfd.is_none() && op == "<" && next_ch == '&' {
                if !self
                    .peek_at(1)
                    .is_some_and(|c| c.is_ascii_digit() || c == '-')
                {
                    self.advance();
                    op = "<&".to_string();
                }
            }
        }
        if op == "<<" {
            return self.parse_heredoc(fd, strip_tabs).map(Some);
        }
        if let Some(varfd) = &varfd {
            op = format!("{{{varfd}}}{op}");
        } else if let Some(fd) = fd {
            op = format!("{fd}{op}");
        }
        let target: Word;
        if self.peek_is('&') {
            self.advance();
            self.skip_whitespace();
            let mut found: Option<Word> = None;
            if self.peek_is('-') {
                if self.peek_at(1).is_some_and(|c| !canon::is_metachar(c)) {
                    self.advance();
                    found = Some(Word::new("&-"));
                }
            }
            if let Some(found) = found {
                target = found;
            } else if self.peek().is_some_and(|c| c.is_ascii_digit() || c == '-') {
                let word_start = self.pos;
                let mut fd_target = String::new();
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    fd_target.push(self.advance());
                }
                if self.peek_is('-') {
                    fd_target.push(self.advance());
                }
                if fd_target != "-" && self.peek().is_some_and(|c| !canon::is_metachar(c)) {
                    self.pos = word_start;
                    let inner_word = self.parse_word(false, false, false)?;
                    let Some(inner_word) = inner_word else {
                        return Err(ParseError::at(
                            format!("Expected target for redirect {op}"),
                            self.pos,
                        ));
                    };
                    target = Word::with_parts(format!("&{}", inner_word.value), inner_word.parts);
                } else {
                    target = Word::new(format!("&{fd_target}"));
                }
            } else {
                let inner_word = self.parse_word(false, false, false)?;
                let Some(inner_word) = inner_word else {
                    return Err(ParseError::at(
                        format!("Expected target for redirect {op}"),
                        self.pos,
                    ));
                };
                target = Word::with_parts(format!("&{}", inner_word.value), inner_word.parts);
            }
        } else {
            self.skip_whitespace();
            let parsed = if matches!(op.as_str(), ">&" | "<&") && self.peek_is('-') {
                if self.peek_at(1).is_some_and(|c| !canon::is_metachar(c)) {
                    self.advance();
                    Some(Word::new("&-"))
                } else {
                    self.parse_word(false, false, false)?
                }
            } else {
                self.parse_word(false, false, false)?
            };
            let Some(parsed) = parsed else {
                return Err(ParseError::at(
                    format!("Expected target for redirect {op}"),
                    self.pos,
                ));
            };
            target = parsed;
        }
        Ok(Some(Node::Redirect(Redirect { op, target })))
    }

    /// Parses a heredoc delimiter, handling mixed quoting and embedded
    /// expansions. Returns the delimiter text and whether it was quoted.
    fn parse_heredoc_delimiter(&mut self) -> Result<(String, bool), ParseError> {
        self.skip_whitespace();
        let mut quoted = false;
        let mut delimiter = String::new();
        loop {
            while !self.at_end() && !self.peek().is_some_and(canon::is_metachar) {
                let ch = self.peek().unwrap_or('\0');
                if ch == '"' {
                    quoted = true;
                    self.advance();
                    while !self.at_end() && !self.peek_is('"') {
                        delimiter.push(self.advance());
                    }
                    if !self.at_end() {
                        self.advance();
                    }
                } else if ch == '\'' {
                    quoted = true;
                    self.advance();
                    while !self.at_end() && !self.peek_is('\'') {
                        let c = self.advance();
                        if c == '\n' {
                            self.saw_newline_in_single_quote = true;
                        }
                        delimiter.push(c);
                    }
                    if !self.at_end() {
                        self.advance();
                    }
                } else if ch == '\\' {
                    self.advance();
                    if !self.at_end() {
                        if self.peek_is('\n') {
                            self.advance();
                        } else {
                            quoted = true;
                            delimiter.push(self.advance());
                        }
                    }
                } else if ch == '$' && self.peek_at(1) == Some('\'') {
                    // ANSI-C quoting in the delimiter resolves its escapes.
                    quoted = true;
                    self.advance();
                    self.advance();
                    while !self.at_end() && !self.peek_is('\'') {
                        let c = self.peek().unwrap_or('\0');
                        if c == '\\' && self.pos + 1 < self.len {
                            self.advance();
                            let esc = self.peek().unwrap_or('\0');
                            if let Some(val) = simple_ansi_escape(esc) {
                                delimiter.push(val as char);
                                self.advance();
                            } else {
                                delimiter.push(self.advance());
                            }
                        } else {
                            delimiter.push(self.advance());
                        }
                    }
                    if !self.at_end() {
                        self.advance();
                    }
                } else if canon::is_expansion_start(&self.src, self.pos, "$(") {
                    delimiter.push(self.advance());
                    delimiter.push(self.advance());
                    let mut depth = 1;
                    while !self.at_end() && depth > 0 {
                        let c = self.peek().unwrap_or('\0');
                        if c == '(' {
                            depth += 1;
                        } else if c == ')' {
                            depth -= 1;
                        }
                        delimiter.push(self.advance());
                    }
                } else if ch == '$' && self.peek_at(1) == Some('{') {
                    if self.dollar_is_escaped() {
                        delimiter.push(self.advance());
                    } else {
                        delimiter.push(self.advance());
                        delimiter.push(self.advance());
                        let mut depth = 0;
                        while !self.at_end() {
                            let c = self.peek().unwrap_or('\0');
                            if c == '{' {
                                depth += 1;
                            } else if c == '}' {
                                delimiter.push(self.advance());
                                if depth == 0 {
                                    break;
                                }
                                depth -= 1;
                                if depth == 0
                                    && self.peek().is_some_and(canon::is_metachar)
                                {
                                    break;
                                }
                                continue;
                            }
                            delimiter.push(self.advance());
                        }
                    }
                } else if ch == '$' && self.peek_at(1) == Some('[') {
                    if self.dollar_is_escaped() {
                        delimiter.push(self.advance());
                    } else {
                        delimiter.push(self.advance());
                        delimiter.push(self.advance());
                        let mut depth = 1;
                        while !self.at_end() && depth > 0 {
                            let c = self.peek().unwrap_or('\0');
                            if c == '[' {
                                depth += 1;
                            } else if c == ']' {
                                depth -= 1;
                            }
                            delimiter.push(self.advance());
                        }
                    }
                } else if ch == '`' {
                    delimiter.push(self.advance());
                    while !self.at_end() && !self.peek_is('`') {
                        let c = self.peek().unwrap_or('\0');
                        if c == '\'' {
                            delimiter.push(self.advance());
                            while !self.at_end() && !self.peek_is('\'') && !self.peek_is('`') {
                                delimiter.push(self.advance());
                            }
                            if self.peek_is('\'') {
                                delimiter.push(self.advance());
                            }
                        } else if c == '"' {
                            delimiter.push(self.advance());
                            while !self.at_end() && !self.peek_is('"') && !self.peek_is('`') {
                                if self.peek_is('\\') && self.pos + 1 < self.len {
                                    delimiter.push(self.advance());
                                }
                                delimiter.push(self.advance());
                            }
                            if self.peek_is('"') {
                                delimiter.push(self.advance());
                            }
                        } else if c == '\\' && self.pos + 1 < self.len {
                            delimiter.push(self.advance());
                            delimiter.push(self.advance());
                        } else {
                            delimiter.push(self.advance());
                        }
                    }
                    if !self.at_end() {
                        delimiter.push(self.advance());
                    }
                } else {
                    delimiter.push(self.advance());
                }
            }
            if self.peek().is_some_and(is_redirect_char) && self.peek_at(1) == Some('(') {
                delimiter.push(self.advance());
                delimiter.push(self.advance());
                let mut depth = 1;
                while !self.at_end() && depth > 0 {
                    let c = self.peek().unwrap_or('\0');
                    if c == '(' {
                        depth += 1;
                    } else if c == ')' {
                        depth -= 1;
                    }
                    delimiter.push(self.advance());
                }
                continue;
            }
            break;
        }
        Ok((delimiter, quoted))
    }

    /// Whether the `$` at the cursor is escaped by preceding `$`s or a
    /// backslash.
    fn dollar_is_escaped(&self) -> bool {
        let mut dollar_count = 0usize;
        let mut j = self.pos as isize - 1;
        while j >= 0 && self.src[j as usize] == '$' {
            dollar_count += 1;
            j -= 1;
        }
        if j >= 0 && self.src[j as usize] == '\\' {
            dollar_count = dollar_count.saturating_sub(1);
        }
        dollar_count % 2 == 1
    }

    /// Reads one heredoc body line, joining backslash-continued lines for
    /// unquoted delimiters. Returns the line and the position of its end.
    fn read_heredoc_line(&mut self, quoted: bool) -> (String, usize) {
        let line_start = self.pos;
        let mut line_end = line_start;
        while line_end < self.len && self.src[line_end] != '\n' {
            line_end += 1;
        }
        let mut line = self.slice(line_start, line_end);
        if !quoted {
            while line_end < self.len {
                if canon::count_trailing_backslashes(&line) % 2 == 0 {
                    break;
                }
                line.pop();
                line_end += 1;
                let next_line_start = line_end;
                while line_end < self.len && self.src[line_end] != '\n' {
                    line_end += 1;
                }
                line.push_str(&self.slice(next_line_start, line_end));
            }
        }
        (line, line_end)
    }

    fn line_matches_delimiter(line: &str, delimiter: &str, strip_tabs: bool) -> (bool, String) {
        let check_line = if strip_tabs {
            line.trim_start_matches('\t').to_string()
        } else {
            line.to_string()
        };
        let normalized_check = canon::normalize_heredoc_delimiter(&check_line);
        let normalized_delim = canon::normalize_heredoc_delimiter(delimiter);
        (normalized_check == normalized_delim, check_line)
    }

    /// Gathers the bodies of all pending heredocs; called whenever a newline
    /// is crossed.
    pub(crate) fn gather_heredoc_bodies(&mut self) {
        let pending = std::mem::take(&mut self.pending_heredocs);
        for heredoc_ref in pending {
            let (delimiter, quoted, strip_tabs) = {
                let h = heredoc_ref.borrow();
                (h.delimiter.clone(), h.quoted, h.strip_tabs)
            };
            let mut content = String::new();
            while self.pos < self.len {
                let line_start = self.pos;
                let (line, line_end) = self.read_heredoc_line(quoted);
                let (matches, check_line) =
                    Self::line_matches_delimiter(&line, &delimiter, strip_tabs);
                if matches {
                    self.pos = if line_end < self.len { line_end + 1 } else { line_end };
                    break;
                }
                let normalized_check = canon::normalize_heredoc_delimiter(&check_line);
                let normalized_delim = canon::normalize_heredoc_delimiter(&delimiter);
                // Inside a command substitution the delimiter may be
                // followed by more shell syntax on the same line.
                if self.eof_token == Some(')') && normalized_check.starts_with(&normalized_delim) {
                    let tabs_stripped = line.chars().count() - check_line.chars().count();
                    self.pos = line_start + tabs_stripped + delimiter.chars().count();
                    break;
                }
                if line_end >= self.len
                    && normalized_check.starts_with(&normalized_delim)
                    && self.in_process_sub
                {
                    let tabs_stripped = line.chars().count() - check_line.chars().count();
                    self.pos = line_start + tabs_stripped + delimiter.chars().count();
                    break;
                }
                let content_line = if strip_tabs {
                    line.trim_start_matches('\t').to_string()
                } else {
                    line.clone()
                };
                if line_end < self.len {
                    content.push_str(&content_line);
                    content.push('\n');
                    self.pos = line_end + 1;
                } else {
                    // At EOF bash keeps a trailing newline unless escaped.
                    let add_newline =
                        quoted || canon::count_trailing_backslashes(&line) % 2 == 0;
                    content.push_str(&content_line);
                    if add_newline {
                        content.push('\n');
                    }
                    self.pos = self.len;
                }
            }
            heredoc_ref.borrow_mut().content = content;
        }
    }

    /// Registers a heredoc whose body is gathered later. A re-parse of the
    /// same operator position returns the already-registered document.
    fn parse_heredoc(&mut self, fd: Option<u32>, strip_tabs: bool) -> Result<Node, ParseError> {
        let start_pos = self.pos;
        self.state.set(ParserState::HEREDOC);
        let (delimiter, quoted) = self.parse_heredoc_delimiter()?;
        for existing in &self.pending_heredocs {
            let h = existing.borrow();
            if h.start_pos == Some(start_pos) && h.delimiter == delimiter {
                drop(h);
                self.state.clear(ParserState::HEREDOC);
                return Ok(Node::HereDoc(existing.clone()));
            }
        }
        let heredoc = Rc::new(RefCell::new(HereDoc {
            delimiter,
            content: String::new(),
            strip_tabs,
            quoted,
            fd,
            start_pos: Some(start_pos),
        }));
        self.pending_heredocs.push(heredoc.clone());
        self.state.clear(ParserState::HEREDOC);
        Ok(Node::HereDoc(heredoc))
    }

    /// Parses a simple command: words and redirects interleaved. The
    /// command-start flag stays true while every preceding word is an
    /// assignment and no redirect has been seen.
    pub(crate) fn parse_command(&mut self) -> Result<Option<Node>, ParseError> {
        let mut words: Vec<Word> = Vec::new();
        let mut redirects: Vec<Node> = Vec::new();
        loop {
            self.skip_whitespace();
            if self.lex_is_command_terminator()? {
                break;
            }
            if words.is_empty() {
                let reserved = self.lex_peek_reserved_word()?;
                if matches!(reserved.as_deref(), Some("}" | "]]")) {
                    break;
                }
            }
            if let Some(redirect) = self.parse_redirect()? {
                redirects.push(redirect);
                continue;
            }
            let all_assignments = words.iter().all(Self::is_assignment_word);
            let in_assign_builtin = words
                .first()
                .is_some_and(|w| is_assignment_builtin(&w.value));
            let at_start = words.is_empty() || (all_assignments && redirects.is_empty());
            let word = self.parse_word(at_start, false, in_assign_builtin)?;
            match word {
                Some(word) => words.push(word),
                None => break,
            }
        }
        if words.is_empty() && redirects.is_empty() {
            return Ok(None);
        }
        Ok(Some(Node::Command(Command { words, redirects })))
    }

    fn parse_subshell(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.peek_is('(') {
            return Ok(None);
        }
        self.advance();
        self.state.set(ParserState::SUBSHELL);
        let result = (|| {
            let body = self.parse_list(true)?;
            let Some(body) = body else {
                return Err(ParseError::at("Expected command in subshell", self.pos));
            };
            self.skip_whitespace();
            if !self.peek_is(')') {
                return Err(ParseError::at("Expected ) to close subshell", self.pos));
            }
            self.advance();
            Ok(body)
        })();
        self.state.clear(ParserState::SUBSHELL);
        let body = result?;
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::Subshell(Subshell {
            body: Box::new(body),
            redirects,
        })))
    }

    /// Parses an arithmetic command `(( expr ))`, backing off when the text
    /// is really nested subshells (`( ( ... ) )`).
    fn parse_arithmetic_command(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !(self.peek_is('(') && self.peek_at(1) == Some('(')) {
            return Ok(None);
        }
        let saved_pos = self.pos;
        self.advance();
        self.advance();
        let content_start = self.pos;
        let mut depth = 1isize;
        while !self.at_end() && depth > 0 {
            let c = self.peek().unwrap_or('\0');
            if c == '\'' {
                self.advance();
                while !self.at_end() && !self.peek_is('\'') {
                    self.advance();
                }
                if !self.at_end() {
                    self.advance();
                }
            } else if c == '"' {
                self.advance();
                while !self.at_end() {
                    if self.peek_is('\\') && self.pos + 1 < self.len {
                        self.advance();
                        self.advance();
                    } else if self.peek_is('"') {
                        self.advance();
                        break;
                    } else {
                        self.advance();
                    }
                }
            } else if c == '\\' && self.pos + 1 < self.len {
                self.advance();
                self.advance();
            } else if c == '(' {
                depth += 1;
                self.advance();
            } else if c == ')' {
                if depth == 1 && self.peek_at(1) == Some(')') {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    self.pos = saved_pos;
                    return Ok(None);
                }
                self.advance();
            } else {
                self.advance();
            }
        }
        if self.at_end() {
            return Err(ParseError::unclosed("))", saved_pos));
        }
        if depth != 1 {
            self.pos = saved_pos;
            return Ok(None);
        }
        let content = self.slice(content_start, self.pos).replace("\\\n", "");
        self.advance();
        self.advance();
        let expr = self.parse_arith_expr(&content)?;
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::ArithmeticCommand(ArithmeticCommand {
            expression: expr.map(Box::new),
            redirects,
            raw_content: content,
        })))
    }

    // `[[ ]]` conditional expressions.

    fn parse_conditional_expr(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !(self.peek_is('[') && self.peek_at(1) == Some('[')) {
            return Ok(None);
        }
        let next_pos = self.pos + 2;
        if let Some(&c) = self.src.get(next_pos) {
            let continuation = c == '\\' && self.src.get(next_pos + 1) == Some(&'\n');
            if !canon::is_whitespace(c) && !continuation {
                return Ok(None);
            }
        }
        self.advance();
        self.advance();
        self.state.set(ParserState::CONDEXPR);
        self.word_context = WordContext::Cond;
        let result = (|| {
            let body = self.parse_cond_or()?;
            while self.peek().is_some_and(canon::is_blank) {
                self.advance();
            }
            if !(self.peek_is(']') && self.peek_at(1) == Some(']')) {
                return Err(ParseError::at(
                    "Expected ]] to close conditional expression",
                    self.pos,
                ));
            }
            self.advance();
            self.advance();
            Ok(body)
        })();
        self.state.clear(ParserState::CONDEXPR);
        self.word_context = WordContext::Normal;
        let body = result?;
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::ConditionalExpr(ConditionalExpr {
            body: Box::new(body),
            redirects,
        })))
    }

    fn cond_skip_whitespace(&mut self) {
        while !self.at_end() {
            let c = self.peek().unwrap_or('\0');
            if canon::is_blank(c) {
                self.advance();
            } else if c == '\\' && self.peek_at(1) == Some('\n') {
                self.advance();
                self.advance();
            } else if c == '\n' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn cond_at_end(&self) -> bool {
        self.at_end() || (self.peek_is(']') && self.peek_at(1) == Some(']'))
    }

    fn parse_cond_or(&mut self) -> Result<Node, ParseError> {
        self.cond_skip_whitespace();
        let left = self.parse_cond_and()?;
        self.cond_skip_whitespace();
        if !self.cond_at_end() && self.peek_is('|') && self.peek_at(1) == Some('|') {
            self.advance();
            self.advance();
            let right = self.parse_cond_or()?;
            return Ok(Node::CondOr(CondBinary {
                left: Box::new(left),
                right: Box::new(right),
            }));
        }
        Ok(left)
    }

    fn parse_cond_and(&mut self) -> Result<Node, ParseError> {
        self.cond_skip_whitespace();
        let left = self.parse_cond_term()?;
        self.cond_skip_whitespace();
        if !self.cond_at_end() && self.peek_is('&') && self.peek_at(1) == Some('&') {
            self.advance();
            self.advance();
            let right = self.parse_cond_and()?;
            return Ok(Node::CondAnd(CondBinary {
                left: Box::new(left),
                right: Box::new(right),
            }));
        }
        Ok(left)
    }

    fn parse_cond_term(&mut self) -> Result<Node, ParseError> {
        self.cond_skip_whitespace();
        if self.cond_at_end() {
            return Err(ParseError::at(
                "Unexpected end of conditional expression",
                self.pos,
            ));
        }
        if self.peek_is('!') {
            // `!` negates only when whitespace follows; `!=` is an operator.
            let followed_by_space = self.peek_at(1).is_none_or(canon::is_blank);
            if followed_by_space {
                self.advance();
                let operand = self.parse_cond_term()?;
                return Ok(Node::CondNot(Box::new(operand)));
            }
        }
        if self.peek_is('(') {
            self.advance();
            let inner = self.parse_cond_or()?;
            self.cond_skip_whitespace();
            if !self.peek_is(')') {
                return Err(ParseError::at(
                    "Expected ) in conditional expression",
                    self.pos,
                ));
            }
            self.advance();
            return Ok(Node::CondParen(Box::new(inner)));
        }
        let word1 = self.parse_cond_word()?;
        let Some(word1) = word1 else {
            return Err(ParseError::at(
                "Expected word in conditional expression",
                self.pos,
            ));
        };
        self.cond_skip_whitespace();
        if is_cond_unary_op(&word1.value) {
            let operand = self.parse_cond_word()?;
            let Some(operand) = operand else {
                return Err(ParseError::at(
                    format!("Expected operand after {}", word1.value),
                    self.pos,
                ));
            };
            return Ok(Node::UnaryTest(UnaryTest {
                op: word1.value,
                operand,
            }));
        }
        if !self.cond_at_end() && !self.peek().is_some_and(|c| matches!(c, '&' | '|' | ')')) {
            if self.peek().is_some_and(is_redirect_char) && self.peek_at(1) != Some('(') {
                let op = self.advance().to_string();
                self.cond_skip_whitespace();
                let word2 = self.parse_cond_word()?;
                let Some(word2) = word2 else {
                    return Err(ParseError::at(
                        format!("Expected operand after {op}"),
                        self.pos,
                    ));
                };
                return Ok(Node::BinaryTest(BinaryTest {
                    op,
                    left: word1,
                    right: word2,
                }));
            }
            let saved_pos = self.pos;
            let op_word = self.parse_cond_word()?;
            if let Some(op_word) = op_word {
                if is_cond_binary_op(&op_word.value) {
                    self.cond_skip_whitespace();
                    let word2 = if op_word.value == "=~" {
                        self.parse_cond_regex_word()?
                    } else {
                        self.parse_cond_word()?
                    };
                    let Some(word2) = word2 else {
                        return Err(ParseError::at(
                            format!("Expected operand after {}", op_word.value),
                            self.pos,
                        ));
                    };
                    return Ok(Node::BinaryTest(BinaryTest {
                        op: op_word.value,
                        left: word1,
                        right: word2,
                    }));
                }
                self.pos = saved_pos;
            } else {
                self.pos = saved_pos;
            }
        }
        // A bare word is an implicit non-empty test.
        Ok(Node::UnaryTest(UnaryTest {
            op: "-n".to_string(),
            operand: word1,
        }))
    }

    fn parse_cond_word(&mut self) -> Result<Option<Word>, ParseError> {
        self.cond_skip_whitespace();
        if self.cond_at_end() {
            return Ok(None);
        }
        let c = self.peek().unwrap_or('\0');
        if matches!(c, '(' | ')') {
            return Ok(None);
        }
        if c == '&' && self.peek_at(1) == Some('&') {
            return Ok(None);
        }
        if c == '|' && self.peek_at(1) == Some('|') {
            return Ok(None);
        }
        self.parse_word_internal(WordContext::Cond, false, false)
    }

    fn parse_cond_regex_word(&mut self) -> Result<Option<Word>, ParseError> {
        self.cond_skip_whitespace();
        if self.cond_at_end() {
            return Ok(None);
        }
        self.state.set(ParserState::REGEXP);
        let result = self.parse_word_internal(WordContext::Regex, false, false);
        self.state.clear(ParserState::REGEXP);
        self.word_context = WordContext::Cond;
        result
    }

    fn parse_brace_group(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("{")? {
            return Ok(None);
        }
        self.skip_whitespace_and_newlines();
        let body = self.parse_list(true)?;
        let Some(body) = body else {
            return Err(ParseError::at(
                "Expected command in brace group",
                self.token_pos(),
            ));
        };
        self.skip_whitespace();
        if !self.lex_consume_word("}")? {
            return Err(ParseError::at(
                "Expected } to close brace group",
                self.token_pos(),
            ));
        }
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::BraceGroup(BraceGroup {
            body: Box::new(body),
            redirects,
        })))
    }

    fn parse_if(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("if")? {
            return Ok(None);
        }
        let condition = self.parse_list_until(&["then"])?;
        let Some(condition) = condition else {
            return Err(ParseError::at(
                "Expected condition after 'if'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("then")? {
            return Err(ParseError::at(
                "Expected 'then' after if condition",
                self.token_pos(),
            ));
        }
        let then_body = self.parse_list_until(&["elif", "else", "fi"])?;
        let Some(then_body) = then_body else {
            return Err(ParseError::at(
                "Expected commands after 'then'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        let mut else_body: Option<Node> = None;
        if self.lex_is_at_reserved_word("elif")? {
            else_body = Some(Node::If(self.parse_elif_chain()?));
        } else if self.lex_is_at_reserved_word("else")? {
            self.lex_consume_word("else")?;
            let body = self.parse_list_until(&["fi"])?;
            let Some(body) = body else {
                return Err(ParseError::at(
                    "Expected commands after 'else'",
                    self.token_pos(),
                ));
            };
            else_body = Some(body);
        }
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("fi")? {
            return Err(ParseError::at(
                "Expected 'fi' to close if statement",
                self.token_pos(),
            ));
        }
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::If(If {
            condition: Box::new(condition),
            then_body: Box::new(then_body),
            else_body: else_body.map(Box::new),
            redirects,
        })))
    }

    fn parse_elif_chain(&mut self) -> Result<If, ParseError> {
        self.lex_consume_word("elif")?;
        let condition = self.parse_list_until(&["then"])?;
        let Some(condition) = condition else {
            return Err(ParseError::at(
                "Expected condition after 'elif'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("then")? {
            return Err(ParseError::at(
                "Expected 'then' after elif condition",
                self.token_pos(),
            ));
        }
        let then_body = self.parse_list_until(&["elif", "else", "fi"])?;
        let Some(then_body) = then_body else {
            return Err(ParseError::at(
                "Expected commands after 'then'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        let mut else_body: Option<Node> = None;
        if self.lex_is_at_reserved_word("elif")? {
            else_body = Some(Node::If(self.parse_elif_chain()?));
        } else if self.lex_is_at_reserved_word("else")? {
            self.lex_consume_word("else")?;
            let body = self.parse_list_until(&["fi"])?;
            let Some(body) = body else {
                return Err(ParseError::at(
                    "Expected commands after 'else'",
                    self.token_pos(),
                ));
            };
            else_body = Some(body);
        }
        Ok(If {
            condition: Box::new(condition),
            then_body: Box::new(then_body),
            else_body: else_body.map(Box::new),
            redirects: Vec::new(),
        })
    }

    fn parse_while(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("while")? {
            return Ok(None);
        }
        let node = self.parse_loop_clause("while")?;
        Ok(Some(Node::While(node)))
    }

    fn parse_until(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("until")? {
            return Ok(None);
        }
        let node = self.parse_loop_clause("until")?;
        Ok(Some(Node::Until(node)))
    }

    fn parse_loop_clause(&mut self, keyword: &str) -> Result<Loop, ParseError> {
        let condition = self.parse_list_until(&["do"])?;
        let Some(condition) = condition else {
            return Err(ParseError::at(
                format!("Expected condition after '{keyword}'"),
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("do")? {
            return Err(ParseError::at(
                format!("Expected 'do' after {keyword} condition"),
                self.token_pos(),
            ));
        }
        let body = self.parse_list_until(&["done"])?;
        let Some(body) = body else {
            return Err(ParseError::at(
                "Expected commands after 'do'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("done")? {
            return Err(ParseError::at(
                format!("Expected 'done' to close {keyword} loop"),
                self.token_pos(),
            ));
        }
        let redirects = self.collect_redirects()?;
        Ok(Loop {
            condition: Box::new(condition),
            body: Box::new(body),
            redirects,
        })
    }

    fn parse_for(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("for")? {
            return Ok(None);
        }
        self.skip_whitespace();
        if self.peek_is('(') && self.peek_at(1) == Some('(') {
            return self.parse_for_arith().map(Some);
        }
        let var_name: String;
        if self.peek_is('$') {
            let var_word = self.parse_word(false, false, false)?;
            let Some(var_word) = var_word else {
                return Err(ParseError::at(
                    "Expected variable name after 'for'",
                    self.token_pos(),
                ));
            };
            var_name = var_word.value;
        } else {
            let Some(name) = self.peek_word() else {
                return Err(ParseError::at(
                    "Expected variable name after 'for'",
                    self.token_pos(),
                ));
            };
            var_name = name;
            self.consume_word(&var_name);
        }
        self.skip_whitespace();
        if self.peek_is(';') {
            self.advance();
        }
        self.skip_whitespace_and_newlines();
        let mut words: Option<Vec<Word>> = None;
        if self.lex_is_at_reserved_word("in")? {
            self.lex_consume_word("in")?;
            self.skip_whitespace();
            let mut saw_delimiter = self
                .peek()
                .is_some_and(|c| matches!(c, ';' | '\n'));
            if self.peek_is(';') {
                self.advance();
            }
            self.skip_whitespace_and_newlines();
            let mut list: Vec<Word> = Vec::new();
            loop {
                self.skip_whitespace();
                if self.at_end() {
                    break;
                }
                if self.peek().is_some_and(|c| matches!(c, ';' | '\n')) {
                    saw_delimiter = true;
                    if self.peek_is(';') {
                        self.advance();
                    }
                    break;
                }
                if self.lex_is_at_reserved_word("do")? {
                    if saw_delimiter {
                        break;
                    }
                    return Err(ParseError::at(
                        "Expected ';' or newline before 'do'",
                        self.token_pos(),
                    ));
                }
                match self.parse_word(false, false, false)? {
                    Some(word) => list.push(word),
                    None => break,
                }
            }
            words = Some(list);
        }
        self.skip_whitespace_and_newlines();
        if self.peek_is('{') {
            let brace = self.parse_brace_group()?;
            let Some(Node::BraceGroup(bg)) = brace else {
                return Err(ParseError::at(
                    "Expected brace group in for loop",
                    self.token_pos(),
                ));
            };
            let redirects = self.collect_redirects()?;
            return Ok(Some(Node::For(For {
                var: var_name,
                words,
                body: bg.body,
                redirects,
            })));
        }
        if !self.lex_consume_word("do")? {
            return Err(ParseError::at(
                "Expected 'do' in for loop",
                self.token_pos(),
            ));
        }
        let body = self.parse_list_until(&["done"])?;
        let Some(body) = body else {
            return Err(ParseError::at(
                "Expected commands after 'do'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("done")? {
            return Err(ParseError::at(
                "Expected 'done' to close for loop",
                self.token_pos(),
            ));
        }
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::For(For {
            var: var_name,
            words,
            body: Box::new(body),
            redirects,
        })))
    }

    fn parse_for_arith(&mut self) -> Result<Node, ParseError> {
        self.advance();
        self.advance();
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut paren_depth = 0usize;
        while !self.at_end() {
            let ch = self.peek().unwrap_or('\0');
            if ch == '(' {
                paren_depth += 1;
                current.push(self.advance());
            } else if ch == ')' {
                if paren_depth > 0 {
                    paren_depth -= 1;
                    current.push(self.advance());
                } else if self.peek_at(1) == Some(')') {
                    parts.push(current.trim_start_matches([' ', '\t']).to_string());
                    self.advance();
                    self.advance();
                    break;
                } else {
                    current.push(self.advance());
                }
            } else if ch == ';' && paren_depth == 0 {
                parts.push(current.trim_start_matches([' ', '\t']).to_string());
                current = String::new();
                self.advance();
            } else {
                current.push(self.advance());
            }
        }
        if parts.len() != 3 {
            return Err(ParseError::at(
                "Expected three expressions in for ((;;))",
                self.pos,
            ));
        }
        let incr = parts.pop().unwrap_or_default();
        let cond = parts.pop().unwrap_or_default();
        let init = parts.pop().unwrap_or_default();
        self.skip_whitespace();
        if self.peek_is(';') {
            self.advance();
        }
        self.skip_whitespace_and_newlines();
        let body = self.parse_loop_body("for loop")?;
        let redirects = self.collect_redirects()?;
        Ok(Node::ForArith(ForArith {
            init,
            cond,
            incr,
            body: Box::new(body),
            redirects,
        }))
    }

    fn parse_select(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("select")? {
            return Ok(None);
        }
        self.skip_whitespace();
        let Some(var_name) = self.peek_word() else {
            return Err(ParseError::at(
                "Expected variable name after 'select'",
                self.token_pos(),
            ));
        };
        self.consume_word(&var_name);
        self.skip_whitespace();
        if self.peek_is(';') {
            self.advance();
        }
        self.skip_whitespace_and_newlines();
        let mut words: Option<Vec<Word>> = None;
        if self.lex_is_at_reserved_word("in")? {
            self.lex_consume_word("in")?;
            self.skip_whitespace_and_newlines();
            let mut list: Vec<Word> = Vec::new();
            loop {
                self.skip_whitespace();
                if self.at_end() {
                    break;
                }
                if self.peek().is_some_and(|c| matches!(c, ';' | '\n' | '{')) {
                    if self.peek_is(';') {
                        self.advance();
                    }
                    break;
                }
                if self.lex_is_at_reserved_word("do")? {
                    break;
                }
                match self.parse_word(false, false, false)? {
                    Some(word) => list.push(word),
                    None => break,
                }
            }
            words = Some(list);
        }
        self.skip_whitespace_and_newlines();
        let body = self.parse_loop_body("select")?;
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::Select(Select {
            var: var_name,
            words,
            body: Box::new(body),
            redirects,
        })))
    }

    fn consume_case_terminator(&mut self) -> Result<String, ParseError> {
        if let Some(term) = self.lex_peek_case_terminator()? {
            self.next_token()?;
            return Ok(term.to_string());
        }
        Ok(";;".to_string())
    }

    fn parse_case(&mut self) -> Result<Option<Node>, ParseError> {
        if !self.consume_word("case") {
            return Ok(None);
        }
        self.state.set(ParserState::CASESTMT);
        let result = self.parse_case_inner();
        self.state.clear(ParserState::CASESTMT);
        self.state.clear(ParserState::CASEPAT);
        result
    }

    fn parse_case_inner(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        let word = self.parse_word(false, false, false)?;
        let Some(word) = word else {
            return Err(ParseError::at(
                "Expected word after 'case'",
                self.token_pos(),
            ));
        };
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("in")? {
            return Err(ParseError::at(
                "Expected 'in' after case word",
                self.token_pos(),
            ));
        }
        self.skip_whitespace_and_newlines();
        let mut patterns: Vec<CasePattern> = Vec::new();
        self.state.set(ParserState::CASEPAT);
        loop {
            self.skip_whitespace_and_newlines();
            if self.lex_is_at_reserved_word("esac")? {
                // `esac` may itself be a pattern: look for `esac) body`.
                let saved = self.pos;
                self.skip_whitespace();
                while !self.at_end()
                    && !self.peek().is_some_and(canon::is_metachar)
                    && !self.peek().is_some_and(|c| matches!(c, '\'' | '"'))
                {
                    self.advance();
                }
                self.skip_whitespace();
                let mut is_pattern = false;
                if self.peek_is(')') {
                    if self.eof_token == Some(')') {
                        is_pattern = false;
                    } else {
                        self.advance();
                        self.skip_whitespace();
                        if let Some(next_ch) = self.peek() {
                            if next_ch == ';' {
                                is_pattern = true;
                            } else if !matches!(next_ch, '\n' | ')') {
                                is_pattern = true;
                            }
                        }
                    }
                }
                self.pos = saved;
                if !is_pattern {
                    break;
                }
            }
            self.skip_whitespace_and_newlines();
            if self.peek_is('(') {
                self.advance();
                self.skip_whitespace_and_newlines();
            }
            let mut pattern = String::new();
            let mut extglob_depth = 0usize;
            while !self.at_end() {
                let ch = self.peek().unwrap_or('\0');
                if ch == ')' {
                    if extglob_depth > 0 {
                        pattern.push(self.advance());
                        extglob_depth -= 1;
                    } else {
                        self.advance();
                        break;
                    }
                } else if ch == '\\' {
                    if self.peek_at(1) == Some('\n') {
                        self.advance();
                        self.advance();
                    } else {
                        pattern.push(self.advance());
                        if !self.at_end() {
                            pattern.push(self.advance());
                        }
                    }
                } else if canon::is_expansion_start(&self.src, self.pos, "$(") {
                    pattern.push(self.advance());
                    pattern.push(self.advance());
                    if self.peek_is('(') {
                        pattern.push(self.advance());
                        let mut paren_depth = 2usize;
                        while !self.at_end() && paren_depth > 0 {
                            let c = self.peek().unwrap_or('\0');
                            if c == '(' {
                                paren_depth += 1;
                            } else if c == ')' {
                                paren_depth -= 1;
                            }
                            pattern.push(self.advance());
                        }
                    } else {
                        extglob_depth += 1;
                    }
                } else if ch == '(' && extglob_depth > 0 {
                    pattern.push(self.advance());
                    extglob_depth += 1;
                } else if self.extglob
                    && canon::is_extglob_prefix(ch)
                    && self.peek_at(1) == Some('(')
                {
                    pattern.push(self.advance());
                    pattern.push(self.advance());
                    extglob_depth += 1;
                } else if ch == '[' {
                    let mut is_char_class = false;
                    let mut scan_pos = self.pos + 1;
                    let mut scan_depth = 0usize;
                    let mut has_first_bracket_literal = false;
                    if self
                        .src
                        .get(scan_pos)
                        .is_some_and(|&c| matches!(c, '!' | '^'))
                    {
                        scan_pos += 1;
                    }
                    if self.src.get(scan_pos) == Some(&']') {
                        scan_pos += 1;
                        has_first_bracket_literal = true;
                    }
                    while scan_pos < self.len {
                        let sc = self.src[scan_pos];
                        if sc == ']' && scan_depth == 0 {
                            is_char_class = true;
                            break;
                        } else if sc == '[' {
                            scan_depth += 1;
                        } else if sc == ')' && scan_depth == 0 {
                            break;
                        } else if sc == '|' && scan_depth == 0 {
                            break;
                        }
                        scan_pos += 1;
                    }
                    if is_char_class {
                        pattern.push(self.advance());
                        if self.peek().is_some_and(|c| matches!(c, '!' | '^')) {
                            pattern.push(self.advance());
                        }
                        if has_first_bracket_literal && self.peek_is(']') {
                            pattern.push(self.advance());
                        }
                        while !self.at_end() && !self.peek_is(']') {
                            pattern.push(self.advance());
                        }
                        if !self.at_end() {
                            pattern.push(self.advance());
                        }
                    } else {
                        pattern.push(self.advance());
                    }
                } else if ch == '\'' {
                    pattern.push(self.advance());
                    while !self.at_end() && !self.peek_is('\'') {
                        pattern.push(self.advance());
                    }
                    if !self.at_end() {
                        pattern.push(self.advance());
                    }
                } else if ch == '"' {
                    pattern.push(self.advance());
                    while !self.at_end() && !self.peek_is('"') {
                        if self.peek_is('\\') && self.pos + 1 < self.len {
                            pattern.push(self.advance());
                        }
                        pattern.push(self.advance());
                    }
                    if !self.at_end() {
                        pattern.push(self.advance());
                    }
                } else if canon::is_whitespace(ch) {
                    if extglob_depth > 0 {
                        pattern.push(self.advance());
                    } else {
                        self.advance();
                    }
                } else {
                    pattern.push(self.advance());
                }
            }
            if pattern.is_empty() {
                return Err(ParseError::at(
                    "Expected pattern in case statement",
                    self.token_pos(),
                ));
            }
            self.skip_whitespace();
            let mut body: Option<Node> = None;
            let is_empty_body = self.lex_peek_case_terminator()?.is_some();
            if !is_empty_body {
                self.skip_whitespace_and_newlines();
                if !self.at_end() && !self.lex_is_at_reserved_word("esac")? {
                    let is_at_terminator = self.lex_peek_case_terminator()?.is_some();
                    if !is_at_terminator {
                        body = self.parse_list_until(&["esac"])?;
                        self.skip_whitespace();
                    }
                }
            }
            let terminator = self.consume_case_terminator()?;
            self.skip_whitespace_and_newlines();
            patterns.push(CasePattern {
                pattern,
                body: body.map(Box::new),
                terminator,
            });
        }
        self.state.clear(ParserState::CASEPAT);
        self.skip_whitespace_and_newlines();
        if !self.lex_consume_word("esac")? {
            return Err(ParseError::at(
                "Expected 'esac' to close case statement",
                self.token_pos(),
            ));
        }
        let redirects = self.collect_redirects()?;
        Ok(Some(Node::Case(Case {
            word,
            patterns,
            redirects,
        })))
    }

    /// Parses a coprocess. A name is recognized only before a compound
    /// command; otherwise everything belongs to the simple command.
    fn parse_coproc(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if !self.lex_consume_word("coproc")? {
            return Ok(None);
        }
        self.skip_whitespace();
        let ch = self.peek();
        if ch == Some('{') {
            if let Some(body) = self.parse_brace_group()? {
                return Ok(Some(Node::Coproc(Coproc {
                    command: Box::new(body),
                    name: None,
                })));
            }
        }
        if ch == Some('(') {
            if self.peek_at(1) == Some('(') {
                if let Some(body) = self.parse_arithmetic_command()? {
                    return Ok(Some(Node::Coproc(Coproc {
                        command: Box::new(body),
                        name: None,
                    })));
                }
            }
            if let Some(body) = self.parse_subshell()? {
                return Ok(Some(Node::Coproc(Coproc {
                    command: Box::new(body),
                    name: None,
                })));
            }
        }
        if let Some(next_word) = self.lex_peek_reserved_word()? {
            if is_compound_keyword(&next_word) {
                if let Some(body) = self.parse_compound_command()? {
                    return Ok(Some(Node::Coproc(Coproc {
                        command: Box::new(body),
                        name: None,
                    })));
                }
            }
        }
        let word_start = self.pos;
        if let Some(potential_name) = self.peek_word() {
            while !self.at_end()
                && !self.peek().is_some_and(canon::is_metachar)
                && !self.peek().is_some_and(|c| matches!(c, '\'' | '"'))
            {
                self.advance();
            }
            self.skip_whitespace();
            let ch = self.peek();
            let next_word = self.lex_peek_reserved_word()?;
            if canon::is_valid_identifier(&potential_name) {
                if ch == Some('{') {
                    if let Some(body) = self.parse_brace_group()? {
                        return Ok(Some(Node::Coproc(Coproc {
                            command: Box::new(body),
                            name: Some(potential_name),
                        })));
                    }
                } else if ch == Some('(') {
                    let body = if self.peek_at(1) == Some('(') {
                        self.parse_arithmetic_command()?
                    } else {
                        self.parse_subshell()?
                    };
                    if let Some(body) = body {
                        return Ok(Some(Node::Coproc(Coproc {
                            command: Box::new(body),
                            name: Some(potential_name),
                        })));
                    }
                } else if next_word.as_deref().is_some_and(is_compound_keyword) {
                    if let Some(body) = self.parse_compound_command()? {
                        return Ok(Some(Node::Coproc(Coproc {
                            command: Box::new(body),
                            name: Some(potential_name),
                        })));
                    }
                }
            }
            self.pos = word_start;
        }
        if let Some(body) = self.parse_command()? {
            return Ok(Some(Node::Coproc(Coproc {
                command: Box::new(body),
                name: None,
            })));
        }
        Err(ParseError::at("Expected command after coproc", self.pos))
    }

    /// Parses a function definition in either the `name()` or the
    /// `function name` form; backtracks when this is not one.
    fn parse_function(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if self.at_end() {
            return Ok(None);
        }
        let saved_pos = self.pos;
        if self.lex_is_at_reserved_word("function")? {
            self.lex_consume_word("function")?;
            self.skip_whitespace();
            let Some(name) = self.peek_word() else {
                self.pos = saved_pos;
                return Ok(None);
            };
            self.consume_word(&name);
            self.skip_whitespace();
            if self.peek_is('(') && self.peek_at(1) == Some(')') {
                self.advance();
                self.advance();
            }
            self.skip_whitespace_and_newlines();
            let body = self.parse_any_compound_command()?;
            let Some(body) = body else {
                return Err(ParseError::at("Expected function body", self.pos));
            };
            return Ok(Some(Node::Function(Function {
                name,
                body: Box::new(body),
            })));
        }
        let Some(name_peek) = self.peek_word() else {
            return Ok(None);
        };
        if is_reserved_word(&name_peek) {
            return Ok(None);
        }
        if canon::looks_like_assignment(&name_peek) {
            return Ok(None);
        }
        self.skip_whitespace();
        let name_start = self.pos;
        while !self.at_end()
            && !self.peek().is_some_and(canon::is_metachar)
            && !self.peek().is_some_and(|c| matches!(c, '\'' | '"' | '(' | ')'))
        {
            self.advance();
        }
        let name = self.slice(name_start, self.pos);
        if name.is_empty() {
            self.pos = saved_pos;
            return Ok(None);
        }
        // A name with an unbalanced `${` is part of a word, not a function.
        let name_chars: Vec<char> = name.chars().collect();
        let mut brace_depth = 0isize;
        let mut i = 0;
        while i < name_chars.len() {
            if canon::is_expansion_start(&name_chars, i, "${") {
                brace_depth += 1;
                i += 2;
                continue;
            }
            if name_chars[i] == '}' {
                brace_depth -= 1;
            }
            i += 1;
        }
        if brace_depth > 0 {
            self.pos = saved_pos;
            return Ok(None);
        }
        let pos_after_name = self.pos;
        self.skip_whitespace();
        let has_whitespace = self.pos > pos_after_name;
        if !has_whitespace
            && name_chars
                .last()
                .is_some_and(|c| "*?@+!$".contains(*c))
        {
            self.pos = saved_pos;
            return Ok(None);
        }
        if !self.peek_is('(') {
            self.pos = saved_pos;
            return Ok(None);
        }
        self.advance();
        self.skip_whitespace();
        if !self.peek_is(')') {
            self.pos = saved_pos;
            return Ok(None);
        }
        self.advance();
        self.skip_whitespace_and_newlines();
        let body = self.parse_any_compound_command()?;
        let Some(body) = body else {
            return Err(ParseError::at("Expected function body", self.pos));
        };
        Ok(Some(Node::Function(Function {
            name,
            body: Box::new(body),
        })))
    }

    /// Tries each compound-command form in turn (for function bodies).
    fn parse_any_compound_command(&mut self) -> Result<Option<Node>, ParseError> {
        if let Some(r) = self.parse_brace_group()? {
            return Ok(Some(r));
        }
        if self.peek_is('(') && self.peek_at(1) == Some('(') {
            if let Some(r) = self.parse_arithmetic_command()? {
                return Ok(Some(r));
            }
        }
        if let Some(r) = self.parse_subshell()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_conditional_expr()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_if()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_while()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_until()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_for()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_case()? {
            return Ok(Some(r));
        }
        if let Some(r) = self.parse_select()? {
            return Ok(Some(r));
        }
        Ok(None)
    }

    fn at_list_until_terminator(&mut self, stop_words: &[&str]) -> Result<bool, ParseError> {
        if self.at_end() {
            return Ok(true);
        }
        if self.peek_is(')') {
            return Ok(true);
        }
        if self.peek_is('}') {
            let next = self.src.get(self.pos + 1);
            if next.is_none() || next.copied().is_some_and(crate::lexer::is_word_end_context) {
                return Ok(true);
            }
        }
        if let Some(reserved) = self.lex_peek_reserved_word()? {
            if stop_words.contains(&reserved.as_str()) {
                return Ok(true);
            }
        }
        if self.lex_peek_case_terminator()?.is_some() {
            return Ok(true);
        }
        Ok(false)
    }

    /// Parses a list that stops before any of the given reserved words.
    pub(crate) fn parse_list_until(
        &mut self,
        stop_words: &[&str],
    ) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace_and_newlines();
        if let Some(reserved) = self.lex_peek_reserved_word()? {
            if stop_words.contains(&reserved.as_str()) {
                return Ok(None);
            }
        }
        let pipeline = self.parse_pipeline()?;
        let Some(pipeline) = pipeline else {
            return Ok(None);
        };
        let mut parts: Vec<Node> = vec![pipeline];
        loop {
            self.skip_whitespace();
            let mut op = self.parse_list_operator()?;
            if op.is_none() {
                if self.peek_is('\n') {
                    self.advance();
                    self.gather_heredoc_bodies();
                    if let Some(end) = self.cmdsub_heredoc_end {
                        if end > self.pos {
                            self.pos = end;
                            self.cmdsub_heredoc_end = None;
                        }
                    }
                    self.skip_whitespace_and_newlines();
                    if self.at_list_until_terminator(stop_words)? {
                        break;
                    }
                    let next_op = self.peek_list_operator()?;
                    if matches!(next_op, Some("&" | ";")) {
                        break;
                    }
                    op = Some("\n");
                } else {
                    break;
                }
            }
            let Some(op) = op else {
                break;
            };
            match op {
                ";" => {
                    self.skip_whitespace_and_newlines();
                    if self.at_list_until_terminator(stop_words)? {
                        break;
                    }
                    parts.push(Node::Operator(Operator { op: op.to_string() }));
                }
                "&" => {
                    parts.push(Node::Operator(Operator { op: op.to_string() }));
                    self.skip_whitespace_and_newlines();
                    if self.at_list_until_terminator(stop_words)? {
                        break;
                    }
                }
                "&&" | "||" => {
                    parts.push(Node::Operator(Operator { op: op.to_string() }));
                    self.skip_whitespace_and_newlines();
                }
                _ => {
                    parts.push(Node::Operator(Operator { op: op.to_string() }));
                }
            }
            if self.at_list_until_terminator(stop_words)? {
                break;
            }
            let pipeline = self.parse_pipeline()?;
            let Some(pipeline) = pipeline else {
                return Err(ParseError::at(
                    format!("Expected command after {op}"),
                    self.pos,
                ));
            };
            parts.push(pipeline);
        }
        if parts.len() == 1 {
            return Ok(parts.pop());
        }
        Ok(Some(Node::List(List { parts })))
    }

    /// Dispatches on lookahead to the matching compound-command production,
    /// falling back to function recognition and then a simple command.
    pub(crate) fn parse_compound_command(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        if self.at_end() {
            return Ok(None);
        }
        let ch = self.peek().unwrap_or('\0');
        if ch == '(' && self.peek_at(1) == Some('(') {
            if let Some(r) = self.parse_arithmetic_command()? {
                return Ok(Some(r));
            }
        }
        if ch == '(' {
            return self.parse_subshell();
        }
        if ch == '{' {
            if let Some(r) = self.parse_brace_group()? {
                return Ok(Some(r));
            }
        }
        if ch == '[' && self.peek_at(1) == Some('[') {
            if let Some(r) = self.parse_conditional_expr()? {
                return Ok(Some(r));
            }
        }
        let mut reserved = self.lex_peek_reserved_word()?;
        if reserved.is_none() && self.in_process_sub {
            // Inside `<(...)` a closing brace can glue to the word.
            if let Some(word) = self.peek_word() {
                if word.chars().count() > 1 && word.starts_with('}') {
                    let keyword_word: String = word.chars().skip(1).collect();
                    if is_reserved_word(&keyword_word) || is_extra_reserved(&keyword_word) {
                        reserved = Some(keyword_word);
                    }
                }
            }
        }
        if let Some(reserved) = reserved.as_deref() {
            if matches!(
                reserved,
                "fi" | "then" | "elif" | "else" | "done" | "esac" | "do" | "in"
            ) {
                return Err(ParseError::at(
                    format!("Unexpected reserved word '{reserved}'"),
                    self.token_pos(),
                ));
            }
            match reserved {
                "if" => return self.parse_if(),
                "while" => return self.parse_while(),
                "until" => return self.parse_until(),
                "for" => return self.parse_for(),
                "select" => return self.parse_select(),
                "case" => return self.parse_case(),
                "function" => return self.parse_function(),
                "coproc" => return self.parse_coproc(),
                _ => {}
            }
        }
        if let Some(f) = self.parse_function()? {
            return Ok(Some(f));
        }
        self.parse_command()
    }

    /// Parses a pipeline with optional `time [-p]` and `!` prefixes.
    pub(crate) fn parse_pipeline(&mut self) -> Result<Option<Node>, ParseError> {
        self.skip_whitespace();
        let mut prefix_order = "";
        let mut time_posix = false;
        if self.lex_is_at_reserved_word("time")? {
            self.lex_consume_word("time")?;
            prefix_order = "time";
            self.skip_whitespace();
            if self.peek_is('-') {
                let saved = self.pos;
                self.advance();
                if self.peek_is('p') {
                    self.advance();
                    if self.at_end() || self.peek().is_some_and(canon::is_metachar) {
                        time_posix = true;
                    } else {
                        self.pos = saved;
                    }
                } else {
                    self.pos = saved;
                }
            }
            self.skip_whitespace();
            if self.starts_with("--") {
                let after = self.src.get(self.pos + 2);
                if after.is_none() || after.copied().is_some_and(canon::is_whitespace) {
                    self.advance();
                    self.advance();
                    time_posix = true;
                    self.skip_whitespace();
                }
            }
            while self.lex_is_at_reserved_word("time")? {
                self.lex_consume_word("time")?;
                self.skip_whitespace();
                if self.peek_is('-') {
                    let saved = self.pos;
                    self.advance();
                    if self.peek_is('p') {
                        self.advance();
                        if self.at_end() || self.peek().is_some_and(canon::is_metachar) {
                            time_posix = true;
                        } else {
                            self.pos = saved;
                        }
                    } else {
                        self.pos = saved;
                    }
                }
            }
            self.skip_whitespace();
            if self.peek_is('!') {
                let at_boundary = self.peek_at(1).is_none_or(is_negation_boundary);
                if at_boundary && !self.is_bang_followed_by_procsub() {
                    self.advance();
                    prefix_order = "time_negation";
                    self.skip_whitespace();
                }
            }
        } else if self.peek_is('!') {
            let at_boundary = self.peek_at(1).is_none_or(is_negation_boundary);
            if at_boundary && !self.is_bang_followed_by_procsub() {
                self.advance();
                self.skip_whitespace();
                // `! ! cmd` cancels; bare `!` is an empty false command.
                let inner = self.parse_pipeline()?;
                if let Some(Node::Negation(neg)) = inner {
                    return Ok(Some(neg.map_or_else(
                        || {
                            Node::Command(Command {
                                words: Vec::new(),
                                redirects: Vec::new(),
                            })
                        },
                        |p| *p,
                    )));
                }
                return Ok(Some(Node::Negation(inner.map(Box::new))));
            }
        }
        let result = self.parse_simple_pipeline()?;
        match prefix_order {
            "time" => Ok(Some(Node::Time(Time {
                pipeline: result.map(Box::new),
                posix: time_posix,
            }))),
            "time_negation" => Ok(Some(Node::Negation(Some(Box::new(Node::Time(Time {
                pipeline: result.map(Box::new),
                posix: time_posix,
            })))))),
            _ => Ok(result),
        }
    }

    fn is_bang_followed_by_procsub(&self) -> bool {
        matches!(self.peek_at(1), Some('<' | '>')) && self.peek_at(2) == Some('(')
    }

    fn parse_simple_pipeline(&mut self) -> Result<Option<Node>, ParseError> {
        let cmd = self.parse_compound_command()?;
        let Some(cmd) = cmd else {
            return Ok(None);
        };
        let mut commands: Vec<Node> = vec![cmd];
        loop {
            self.skip_whitespace();
            let Some((kind, _)) = self.lex_peek_operator()? else {
                break;
            };
            if !matches!(kind, TokenKind::Pipe | TokenKind::PipeAmp) {
                break;
            }
            self.next_token()?;
            let is_pipe_both = kind == TokenKind::PipeAmp;
            self.skip_whitespace_and_newlines();
            if is_pipe_both {
                commands.push(Node::PipeBoth);
            }
            let cmd = self.parse_compound_command()?;
            let Some(cmd) = cmd else {
                return Err(ParseError::at("Expected command after |", self.pos));
            };
            commands.push(cmd);
        }
        if commands.len() == 1 {
            return Ok(commands.pop());
        }
        Ok(Some(Node::Pipeline(Pipeline { commands })))
    }

    fn parse_list_operator(&mut self) -> Result<Option<&'static str>, ParseError> {
        self.skip_whitespace();
        let Some((kind, _)) = self.lex_peek_operator()? else {
            return Ok(None);
        };
        let op = match kind {
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Semi => ";",
            TokenKind::Amp => "&",
            _ => return Ok(None),
        };
        self.next_token()?;
        Ok(Some(op))
    }

    fn peek_list_operator(&mut self) -> Result<Option<&'static str>, ParseError> {
        let saved_pos = self.pos;
        let op = self.parse_list_operator()?;
        self.pos = saved_pos;
        Ok(op)
    }

    /// Parses a command list. With `newline_as_separator` false (top level),
    /// a newline ends the list instead of joining it.
    pub(crate) fn parse_list(
        &mut self,
        newline_as_separator: bool,
    ) -> Result<Option<Node>, ParseError> {
        if newline_as_separator {
            self.skip_whitespace_and_newlines();
        } else {
            self.skip_whitespace();
        }
        let pipeline = self.parse_pipeline()?;
        let Some(pipeline) = pipeline else {
            return Ok(None);
        };
        let mut parts: Vec<Node> = vec![pipeline];
        if self.state.contains(ParserState::EOFTOKEN) && self.at_eof_token()? {
            if parts.len() == 1 {
                return Ok(parts.pop());
            }
            return Ok(Some(Node::List(List { parts })));
        }
        loop {
            self.skip_whitespace();
            let mut op = self.parse_list_operator()?;
            if op.is_none() {
                if self.peek_is('\n') {
                    if !newline_as_separator {
                        break;
                    }
                    self.advance();
                    self.gather_heredoc_bodies();
                    if let Some(end) = self.cmdsub_heredoc_end {
                        if end > self.pos {
                            self.pos = end;
                            self.cmdsub_heredoc_end = None;
                        }
                    }
                    self.skip_whitespace_and_newlines();
                    if self.at_end() || self.at_list_terminating_bracket() {
                        break;
                    }
                    let next_op = self.peek_list_operator()?;
                    if matches!(next_op, Some("&" | ";")) {
                        break;
                    }
                    op = Some("\n");
                } else {
                    break;
                }
            }
            let Some(op) = op else {
                break;
            };
            parts.push(Node::Operator(Operator { op: op.to_string() }));
            match op {
                "&&" | "||" => {
                    self.skip_whitespace_and_newlines();
                }
                "&" | ";" => {
                    self.skip_whitespace();
                    if self.at_end() || self.at_list_terminating_bracket() {
                        break;
                    }
                    if self.peek_is('\n') {
                        if newline_as_separator {
                            self.skip_whitespace_and_newlines();
                            if self.at_end() || self.at_list_terminating_bracket() {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                _ => {}
            }
            let pipeline = self.parse_pipeline()?;
            let Some(pipeline) = pipeline else {
                return Err(ParseError::at(
                    format!("Expected command after {op}"),
                    self.pos,
                ));
            };
            parts.push(pipeline);
            if self.state.contains(ParserState::EOFTOKEN) && self.at_eof_token()? {
                break;
            }
        }
        if parts.len() == 1 {
            return Ok(parts.pop());
        }
        Ok(Some(Node::List(List { parts })))
    }

    fn parse_comment(&mut self) -> Option<Node> {
        if !self.peek_is('#') {
            return None;
        }
        let start = self.pos;
        while !self.at_end() && !self.peek_is('\n') {
            self.advance();
        }
        Some(Node::Comment(self.slice(start, self.pos)))
    }

    /// Parses the entire input into a sequence of top-level nodes.
    pub fn parse(&mut self) -> Result<Vec<Node>, ParseError> {
        tracing::debug!("parsing {} chars", self.len);
        let trimmed: String = self.slice(0, self.len).trim().to_string();
        if trimmed.is_empty() {
            return Ok(vec![Node::Empty]);
        }
        let mut results: Vec<Node> = Vec::new();
        // Leading comment lines are not part of the program.
        loop {
            self.skip_whitespace();
            while self.peek_is('\n') {
                self.advance();
            }
            if self.at_end() {
                break;
            }
            if self.parse_comment().is_none() {
                break;
            }
        }
        while !self.at_end() {
            if let Some(result) = self.parse_list(false)? {
                results.push(result);
            }
            self.skip_whitespace();
            let mut found_newline = false;
            while self.peek_is('\n') {
                found_newline = true;
                self.advance();
                self.gather_heredoc_bodies();
                if let Some(end) = self.cmdsub_heredoc_end {
                    if end > self.pos {
                        self.pos = end;
                        self.cmdsub_heredoc_end = None;
                    }
                }
                self.skip_whitespace();
            }
            if !found_newline && !self.at_end() {
                return Err(ParseError::at("Syntax error", self.pos));
            }
        }
        if results.is_empty() {
            return Ok(vec![Node::Empty]);
        }
        // A line-continuation artifact crossing a single-quote boundary can
        // leave a dangling backslash on the final word; strip it.
        if self.saw_newline_in_single_quote
            && self.src.last() == Some(&'\\')
            && !(self.len >= 3
                && self.src[self.len - 3] == '\\'
                && self.src[self.len - 2] == '\n')
            && results.len() < 2
        {
            strip_trailing_backslash_from_last_word(&mut results);
        }
        Ok(results)
    }
}

fn find_last_word_mut(node: &mut Node) -> Option<&mut Word> {
    match node {
        Node::Word(w) => Some(w),
        Node::Command(c) => {
            let last_has_backslash = c.words.last().is_some_and(|w| w.value.ends_with('\\'));
            if last_has_backslash {
                return c.words.last_mut();
            }
            if let Some(Node::Redirect(r)) = c.redirects.last_mut() {
                return Some(&mut r.target);
            }
            c.words.last_mut()
        }
        Node::Pipeline(p) => p.commands.last_mut().and_then(find_last_word_mut),
        Node::List(l) => l.parts.last_mut().and_then(find_last_word_mut),
        _ => None,
    }
}

fn strip_trailing_backslash_from_last_word(nodes: &mut [Node]) {
    let Some(last_node) = nodes.last_mut() else {
        return;
    };
    let mut became_empty = false;
    if let Some(word) = find_last_word_mut(last_node) {
        if word.value.ends_with('\\') {
            word.value.pop();
            became_empty = word.value.is_empty();
        }
    }
    if became_empty {
        if let Node::Command(c) = last_node {
            c.words.pop();
        }
    }
}

fn simple_ansi_escape(c: char) -> Option<u8> {
    match c {
        'a' => Some(0x07),
        'b' => Some(0x08),
        'e' | 'E' => Some(0x1b),
        'f' => Some(0x0c),
        'n' => Some(0x0a),
        'r' => Some(0x0d),
        't' => Some(0x09),
        'v' => Some(0x0b),
        '\\' => Some(0x5c),
        '"' => Some(0x22),
        '?' => Some(0x3f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sexps(input: &str) -> Vec<String> {
        let mut parser = Parser::new(input, &ParserOptions::default());
        parser
            .parse()
            .expect("parse")
            .iter()
            .map(Node::to_sexp)
            .collect()
    }

    fn sexp(input: &str) -> String {
        let all = sexps(input);
        assert_eq!(all.len(), 1, "expected a single top-level node");
        all[0].clone()
    }

    #[test]
    fn simple_command() {
        assert_eq!(sexp("echo hi"), "(command (word \"echo\") (word \"hi\"))");
    }

    #[test]
    fn empty_input_yields_empty_node() {
        assert_eq!(sexp(""), "");
        assert_eq!(sexp("   \n  "), "");
    }

    #[test]
    fn pipeline_and_list_precedence() {
        assert_eq!(
            sexp("a && b || c"),
            "(or (and (command (word \"a\")) (command (word \"b\"))) (command (word \"c\")))"
        );
        assert_eq!(
            sexp("a | b"),
            "(pipe (command (word \"a\")) (command (word \"b\")))"
        );
        assert_eq!(
            sexp("a; b & c"),
            "(semi (command (word \"a\")) (background (command (word \"b\")) (command (word \"c\"))))"
        );
    }

    #[test]
    fn top_level_lines_are_separate_nodes() {
        assert_eq!(
            sexps("echo a\necho b"),
            vec![
                "(command (word \"echo\") (word \"a\"))".to_string(),
                "(command (word \"echo\") (word \"b\"))".to_string(),
            ]
        );
    }

    #[test]
    fn if_statement() {
        assert_eq!(
            sexp("if true; then echo hi; fi"),
            "(if (command (word \"true\")) (command (word \"echo\") (word \"hi\")))"
        );
        assert_eq!(
            sexp("if a; then b; else c; fi"),
            "(if (command (word \"a\")) (command (word \"b\")) (command (word \"c\")))"
        );
    }

    #[test]
    fn elif_chain_nests() {
        assert_eq!(
            sexp("if a; then b; elif c; then d; fi"),
            "(if (command (word \"a\")) (command (word \"b\")) (if (command (word \"c\")) (command (word \"d\"))))"
        );
    }

    #[test]
    fn while_and_for() {
        assert_eq!(
            sexp("while x; do y; done"),
            "(while (command (word \"x\")) (command (word \"y\")))"
        );
        assert_eq!(
            sexp("for x in a b; do echo $x; done"),
            "(for (word \"x\") (in (word \"a\") (word \"b\")) (command (word \"echo\") (word \"$x\")))"
        );
        assert_eq!(
            sexp("for x; do echo; done"),
            "(for (word \"x\") (in (word \"\\\"$@\\\"\")) (command (word \"echo\")))"
        );
    }

    #[test]
    fn arithmetic_for_loop() {
        assert_eq!(
            sexp("for ((i=0; i<3; i++)); do echo; done"),
            "(arith-for (init (word \"i=0\")) (test (word \"i<3\")) (step (word \"i++\")) (command (word \"echo\")))"
        );
    }

    #[test]
    fn case_statement() {
        assert_eq!(
            sexp("case $x in a) echo a;; b|c) echo bc;; esac"),
            "(case (word \"$x\") (pattern ((word \"a\")) (command (word \"echo\") (word \"a\"))) (pattern ((word \"b\") (word \"c\")) (command (word \"echo\") (word \"bc\"))))"
        );
    }

    #[test]
    fn function_definitions() {
        assert_eq!(
            sexp("f() { echo hi; }"),
            "(function \"f\" (brace-group (command (word \"echo\") (word \"hi\"))))"
        );
        assert_eq!(
            sexp("function g { echo hi; }"),
            "(function \"g\" (brace-group (command (word \"echo\") (word \"hi\"))))"
        );
    }

    #[test]
    fn subshell_and_brace_group() {
        assert_eq!(sexp("(a)"), "(subshell (command (word \"a\")))");
        assert_eq!(
            sexp("{ a; b; }"),
            "(brace-group (semi (command (word \"a\")) (command (word \"b\"))))"
        );
    }

    #[test]
    fn redirects() {
        assert_eq!(
            sexp("echo hi > file"),
            "(command (word \"echo\") (word \"hi\") (redirect \">\" \"file\"))"
        );
        assert_eq!(
            sexp("cmd 2>&1"),
            "(command (word \"cmd\") (redirect \">&\" 1))"
        );
        assert_eq!(
            sexp("cmd &> all"),
            "(command (word \"cmd\") (redirect \"&>\" \"all\"))"
        );
    }

    // Heredoc bodies are embedded raw in the canonical text, embedded
    // newlines included.

    #[test]
    fn heredoc_body_collection() {
        assert_eq!(
            sexp("cat <<EOF\nhi\nEOF\n"),
            "(command (word \"cat\") (redirect \"<<\" \"hi\n\"))"
        );
    }

    #[test]
    fn heredoc_strips_tabs_when_dashed() {
        assert_eq!(
            sexp("cat <<-EOF\n\thi\n\tEOF\n"),
            "(command (word \"cat\") (redirect \"<<-\" \"hi\n\"))"
        );
    }

    #[test]
    fn multiple_heredocs_stack_in_order() {
        assert_eq!(
            sexp("cat <<A <<B\none\nA\ntwo\nB\n"),
            "(command (word \"cat\") (redirect \"<<\" \"one\n\") (redirect \"<<\" \"two\n\"))"
        );
    }

    #[test]
    fn heredoc_delimiter_is_not_a_substring_match() {
        assert_eq!(
            sexp("cat <<EOF\nEOF2\nEOF\n"),
            "(command (word \"cat\") (redirect \"<<\" \"EOF2\n\"))"
        );
    }

    #[test]
    fn conditional_expressions() {
        assert_eq!(
            sexp("[[ -z \"$x\" ]]"),
            "(cond (cond-unary \"-z\" (cond-term \"\"$x\"\")))"
        );
        assert_eq!(
            sexp("[[ $a == $b ]]"),
            "(cond (cond-binary \"==\" (cond-term \"$a\") (cond-term \"$b\")))"
        );
        assert_eq!(
            sexp("[[ a && b ]]"),
            "(cond (cond-and (cond-unary \"-n\" (cond-term \"a\")) (cond-unary \"-n\" (cond-term \"b\"))))"
        );
    }

    #[test]
    fn negation_and_time() {
        assert_eq!(sexp("! x"), "(negation (command (word \"x\")))");
        assert_eq!(sexp("! ! x"), "(command (word \"x\"))");
        assert_eq!(sexp("time x"), "(time (command (word \"x\")))");
        assert_eq!(sexp("time -p x"), "(time -p (command (word \"x\")))");
        assert_eq!(
            sexp("time ! x"),
            "(negation (time (command (word \"x\"))))"
        );
    }

    #[test]
    fn pipe_both() {
        assert_eq!(
            sexp("a |& b"),
            "(pipe (command (word \"a\") (redirect \">&\" 1)) (command (word \"b\")))"
        );
    }

    #[test]
    fn command_substitution_in_word() {
        assert_eq!(
            sexp("echo $(echo hi)"),
            "(command (word \"echo\") (word \"$(echo hi)\"))"
        );
        // The substitution's interior is re-parsed and canonically spaced.
        assert_eq!(
            sexp("echo $(  foo;bar )"),
            "(command (word \"echo\") (word \"$(foo; bar)\"))"
        );
    }

    #[test]
    fn arithmetic_expansion() {
        assert_eq!(
            sexp("echo $((1 + 2))"),
            "(command (word \"echo\") (word \"$((1 + 2))\"))"
        );
    }

    #[test]
    fn arithmetic_command() {
        assert_eq!(sexp("((x+1))"), "(arith (word \"x+1\"))");
    }

    #[test]
    fn array_assignment() {
        assert_eq!(sexp("a=(1 2 3)"), "(command (word \"a=(1 2 3)\"))");
        assert_eq!(sexp("a=(1  2\t3)"), "(command (word \"a=(1 2 3)\"))");
    }

    #[test]
    fn coproc_forms() {
        assert_eq!(
            sexp("coproc x { echo; }"),
            "(coproc \"x\" (brace-group (command (word \"echo\"))))"
        );
        assert_eq!(
            sexp("coproc echo hi"),
            "(coproc \"COPROC\" (command (word \"echo\") (word \"hi\")))"
        );
    }

    #[test]
    fn select_statement() {
        assert_eq!(
            sexp("select x in a b; do echo; done"),
            "(select (word \"x\") (in (word \"a\") (word \"b\")) (command (word \"echo\")))"
        );
    }

    #[test]
    fn unterminated_inputs_error() {
        let mut p = Parser::new("\"foo", &ParserOptions::default());
        let err = p.parse().expect_err("unterminated double quote");
        assert_eq!(err.position(), Some(0));
        assert!(Parser::new("$(foo", &ParserOptions::default()).parse().is_err());
        assert!(Parser::new("if true; then echo; ", &ParserOptions::default())
            .parse()
            .is_err());
        assert!(Parser::new("case x in a) echo", &ParserOptions::default())
            .parse()
            .is_err());
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(sexp("# leading\necho hi"), "(command (word \"echo\") (word \"hi\"))");
        assert_eq!(sexp("echo hi # trailing"), "(command (word \"echo\") (word \"hi\"))");
    }

    #[test]
    fn process_substitution() {
        assert_eq!(
            sexp("diff <(sort a) <(sort b)"),
            "(command (word \"diff\") (word \"<(sort a)\") (word \"<(sort b)\"))"
        );
    }

    #[test]
    fn funsub_parses() {
        assert_eq!(
            sexp("echo ${ foo; }"),
            "(command (word \"echo\") (word \"${ foo; }\"))"
        );
    }
}
