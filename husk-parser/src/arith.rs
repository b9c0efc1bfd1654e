//! The arithmetic sub-parser: a precedence-climbing recursive descent over
//! the *content* of `$(( ))`, `(( ))` and `$[ ]`, running on an independent
//! cursor into the extracted substring.
//!
//! `$((...))` nested inside an expression recurses into this same parser;
//! `$(...)` and backticks recurse into a fresh main [`Parser`] over their
//! content.

use crate::ast::{
    ArithAssign, ArithBinaryOp, ArithSubscript, ArithTernary, ArithUnaryOp, CommandSubstitution,
    CondBinary, Node, ParamExpansion, ParamIndirect, ParamLength,
};
use crate::error::ParseError;
use crate::parser::Parser;

fn is_param_expansion_op(c: char) -> bool {
    matches!(
        c,
        ':' | '-' | '=' | '+' | '?' | '#' | '%' | '/' | '^' | ',' | '@' | '*' | '['
    )
}

impl Parser {
    /// Parses an arithmetic expression string into AST nodes. Returns `None`
    /// for empty content. The arithmetic cursor nests, so `$((...))` inside
    /// an expression can re-enter this parser.
    pub(crate) fn parse_arith_expr(&mut self, content: &str) -> Result<Option<Node>, ParseError> {
        tracing::trace!("parsing arithmetic expression: {content:?}");
        let saved_src = std::mem::take(&mut self.arith_src);
        let saved_pos = self.arith_pos;
        let saved_state = self.state;
        self.state.set(crate::lexer::ParserState::ARITH);
        self.arith_src = content.chars().collect();
        self.arith_pos = 0;
        let result = (|| {
            self.arith_skip_ws();
            if self.arith_at_end() {
                Ok(None)
            } else {
                self.arith_parse_comma().map(Some)
            }
        })();
        self.state = saved_state;
        self.arith_src = saved_src;
        self.arith_pos = saved_pos;
        result
    }

    fn arith_at_end(&self) -> bool {
        self.arith_pos >= self.arith_src.len()
    }

    fn arith_peek(&self, offset: usize) -> Option<char> {
        self.arith_src.get(self.arith_pos + offset).copied()
    }

    fn arith_peek_is(&self, offset: usize, c: char) -> bool {
        self.arith_peek(offset) == Some(c)
    }

    fn arith_advance(&mut self) -> char {
        if let Some(&c) = self.arith_src.get(self.arith_pos) {
            self.arith_pos += 1;
            c
        } else {
            '\0'
        }
    }

    fn arith_skip_ws(&mut self) {
        while let Some(&c) = self.arith_src.get(self.arith_pos) {
            if matches!(c, ' ' | '\t' | '\n') {
                self.arith_pos += 1;
            } else if c == '\\' && self.arith_src.get(self.arith_pos + 1) == Some(&'\n') {
                self.arith_pos += 2;
            } else {
                break;
            }
        }
    }

    fn arith_match(&self, s: &str) -> bool {
        crate::canon::starts_with_at(&self.arith_src, self.arith_pos, s)
    }

    fn arith_consume(&mut self, s: &str) -> bool {
        if self.arith_match(s) {
            self.arith_pos += s.chars().count();
            true
        } else {
            false
        }
    }

    fn arith_parse_comma(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_assign()?;
        loop {
            self.arith_skip_ws();
            if self.arith_consume(",") {
                self.arith_skip_ws();
                let right = self.arith_parse_assign()?;
                left = Node::ArithComma(CondBinary {
                    left: Box::new(left),
                    right: Box::new(right),
                });
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_assign(&mut self) -> Result<Node, ParseError> {
        let left = self.arith_parse_ternary()?;
        self.arith_skip_ws();
        const ASSIGN_OPS: [&str; 11] = [
            "<<=", ">>=", "+=", "-=", "*=", "/=", "%=", "&=", "^=", "|=", "=",
        ];
        for op in ASSIGN_OPS {
            if self.arith_match(op) {
                if op == "=" && self.arith_peek_is(1, '=') {
                    break;
                }
                self.arith_consume(op);
                self.arith_skip_ws();
                let right = self.arith_parse_assign()?;
                return Ok(Node::ArithAssign(ArithAssign {
                    op: op.to_string(),
                    target: Box::new(left),
                    value: Box::new(right),
                }));
            }
        }
        Ok(left)
    }

    fn arith_parse_ternary(&mut self) -> Result<Node, ParseError> {
        let cond = self.arith_parse_logical_or()?;
        self.arith_skip_ws();
        if self.arith_consume("?") {
            self.arith_skip_ws();
            // Either branch may be empty; invalid at evaluation, valid syntax.
            let if_true = if self.arith_match(":") {
                Node::ArithEmpty
            } else {
                self.arith_parse_assign()?
            };
            self.arith_skip_ws();
            let if_false = if self.arith_consume(":") {
                self.arith_skip_ws();
                if self.arith_at_end() || self.arith_peek_is(0, ')') {
                    Node::ArithEmpty
                } else {
                    self.arith_parse_ternary()?
                }
            } else {
                Node::ArithEmpty
            };
            return Ok(Node::ArithTernary(ArithTernary {
                condition: Box::new(cond),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            }));
        }
        Ok(cond)
    }

    fn binary(op: &str, left: Node, right: Node) -> Node {
        Node::ArithBinaryOp(ArithBinaryOp {
            op: op.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith_parse_logical_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_logical_and()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("||") {
                self.arith_consume("||");
                self.arith_skip_ws();
                let right = self.arith_parse_logical_and()?;
                left = Self::binary("||", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_logical_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_bitwise_or()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("&&") {
                self.arith_consume("&&");
                self.arith_skip_ws();
                let right = self.arith_parse_bitwise_or()?;
                left = Self::binary("&&", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_bitwise_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_bitwise_xor()?;
        loop {
            self.arith_skip_ws();
            if self.arith_peek_is(0, '|')
                && !self.arith_peek_is(1, '|')
                && !self.arith_peek_is(1, '=')
            {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_bitwise_xor()?;
                left = Self::binary("|", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_bitwise_xor(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_bitwise_and()?;
        loop {
            self.arith_skip_ws();
            if self.arith_peek_is(0, '^') && !self.arith_peek_is(1, '=') {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_bitwise_and()?;
                left = Self::binary("^", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_bitwise_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_equality()?;
        loop {
            self.arith_skip_ws();
            if self.arith_peek_is(0, '&')
                && !self.arith_peek_is(1, '&')
                && !self.arith_peek_is(1, '=')
            {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_equality()?;
                left = Self::binary("&", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_equality(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_comparison()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("==") {
                self.arith_consume("==");
                self.arith_skip_ws();
                let right = self.arith_parse_comparison()?;
                left = Self::binary("==", left, right);
            } else if self.arith_match("!=") {
                self.arith_consume("!=");
                self.arith_skip_ws();
                let right = self.arith_parse_comparison()?;
                left = Self::binary("!=", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_comparison(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_shift()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("<=") {
                self.arith_consume("<=");
                self.arith_skip_ws();
                let right = self.arith_parse_shift()?;
                left = Self::binary("<=", left, right);
            } else if self.arith_match(">=") {
                self.arith_consume(">=");
                self.arith_skip_ws();
                let right = self.arith_parse_shift()?;
                left = Self::binary(">=", left, right);
            } else if self.arith_peek_is(0, '<')
                && !self.arith_peek_is(1, '<')
                && !self.arith_peek_is(1, '=')
            {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_shift()?;
                left = Self::binary("<", left, right);
            } else if self.arith_peek_is(0, '>')
                && !self.arith_peek_is(1, '>')
                && !self.arith_peek_is(1, '=')
            {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_shift()?;
                left = Self::binary(">", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_shift(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_additive()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("<<=") || self.arith_match(">>=") {
                break;
            }
            if self.arith_match("<<") {
                self.arith_consume("<<");
                self.arith_skip_ws();
                let right = self.arith_parse_additive()?;
                left = Self::binary("<<", left, right);
            } else if self.arith_match(">>") {
                self.arith_consume(">>");
                self.arith_skip_ws();
                let right = self.arith_parse_additive()?;
                left = Self::binary(">>", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_additive(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_multiplicative()?;
        loop {
            self.arith_skip_ws();
            let c = self.arith_peek(0);
            let c2 = self.arith_peek(1);
            if c == Some('+') && !matches!(c2, Some('+' | '=')) {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_multiplicative()?;
                left = Self::binary("+", left, right);
            } else if c == Some('-') && !matches!(c2, Some('-' | '=')) {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_multiplicative()?;
                left = Self::binary("-", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_multiplicative(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_exponentiation()?;
        loop {
            self.arith_skip_ws();
            let c = self.arith_peek(0);
            let c2 = self.arith_peek(1);
            if c == Some('*') && !matches!(c2, Some('*' | '=')) {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_exponentiation()?;
                left = Self::binary("*", left, right);
            } else if c == Some('/') && c2 != Some('=') {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_exponentiation()?;
                left = Self::binary("/", left, right);
            } else if c == Some('%') && c2 != Some('=') {
                self.arith_advance();
                self.arith_skip_ws();
                let right = self.arith_parse_exponentiation()?;
                left = Self::binary("%", left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_exponentiation(&mut self) -> Result<Node, ParseError> {
        let left = self.arith_parse_unary()?;
        self.arith_skip_ws();
        if self.arith_match("**") {
            self.arith_consume("**");
            self.arith_skip_ws();
            // Right-associative.
            let right = self.arith_parse_exponentiation()?;
            return Ok(Self::binary("**", left, right));
        }
        Ok(left)
    }

    fn arith_parse_unary(&mut self) -> Result<Node, ParseError> {
        self.arith_skip_ws();
        if self.arith_match("++") {
            self.arith_consume("++");
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithPreIncr(Box::new(operand)));
        }
        if self.arith_match("--") {
            self.arith_consume("--");
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithPreDecr(Box::new(operand)));
        }
        let c = self.arith_peek(0);
        if c == Some('!') {
            self.arith_advance();
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithUnaryOp(ArithUnaryOp {
                op: "!".to_string(),
                operand: Box::new(operand),
            }));
        }
        if c == Some('~') {
            self.arith_advance();
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithUnaryOp(ArithUnaryOp {
                op: "~".to_string(),
                operand: Box::new(operand),
            }));
        }
        if c == Some('+') && !self.arith_peek_is(1, '+') {
            self.arith_advance();
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithUnaryOp(ArithUnaryOp {
                op: "+".to_string(),
                operand: Box::new(operand),
            }));
        }
        if c == Some('-') && !self.arith_peek_is(1, '-') {
            self.arith_advance();
            self.arith_skip_ws();
            let operand = self.arith_parse_unary()?;
            return Ok(Node::ArithUnaryOp(ArithUnaryOp {
                op: "-".to_string(),
                operand: Box::new(operand),
            }));
        }
        self.arith_parse_postfix()
    }

    fn arith_parse_postfix(&mut self) -> Result<Node, ParseError> {
        let mut left = self.arith_parse_primary()?;
        loop {
            self.arith_skip_ws();
            if self.arith_match("++") {
                self.arith_consume("++");
                left = Node::ArithPostIncr(Box::new(left));
            } else if self.arith_match("--") {
                self.arith_consume("--");
                left = Node::ArithPostDecr(Box::new(left));
            } else if self.arith_peek_is(0, '[') {
                // Subscripts attach to bare variables only.
                if let Node::ArithVar(name) = &left {
                    let array = name.clone();
                    self.arith_advance();
                    self.arith_skip_ws();
                    let index = self.arith_parse_comma()?;
                    self.arith_skip_ws();
                    if !self.arith_consume("]") {
                        return Err(ParseError::at(
                            "Expected ']' in array subscript",
                            self.arith_pos,
                        ));
                    }
                    left = Node::ArithSubscript(ArithSubscript {
                        array,
                        index: Box::new(index),
                    });
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn arith_parse_primary(&mut self) -> Result<Node, ParseError> {
        self.arith_skip_ws();
        let c = self.arith_peek(0);
        if c == Some('(') {
            self.arith_advance();
            self.arith_skip_ws();
            let expr = self.arith_parse_comma()?;
            self.arith_skip_ws();
            if !self.arith_consume(")") {
                return Err(ParseError::at(
                    "Expected ')' in arithmetic expression",
                    self.arith_pos,
                ));
            }
            return Ok(expr);
        }
        if c == Some('#') && self.arith_peek_is(1, '$') {
            self.arith_advance();
            return self.arith_parse_expansion();
        }
        if c == Some('$') {
            return self.arith_parse_expansion();
        }
        if c == Some('\'') {
            return self.arith_parse_single_quote();
        }
        if c == Some('"') {
            return self.arith_parse_double_quote();
        }
        if c == Some('`') {
            return self.arith_parse_backtick();
        }
        if c == Some('\\') {
            self.arith_advance();
            if self.arith_at_end() {
                return Err(ParseError::at(
                    "Unexpected end after backslash in arithmetic",
                    self.arith_pos,
                ));
            }
            let escaped = self.arith_advance();
            return Ok(Node::ArithEscape(escaped.to_string()));
        }
        match c {
            None => Ok(Node::ArithEmpty),
            Some(ch) if ")]:,;?|&<>=!+-*/%^~#{}".contains(ch) => Ok(Node::ArithEmpty),
            Some(_) => self.arith_parse_number_or_var(),
        }
    }

    fn arith_parse_expansion(&mut self) -> Result<Node, ParseError> {
        if !self.arith_consume("$") {
            return Err(ParseError::at("Expected '$'", self.arith_pos));
        }
        let c = self.arith_peek(0);
        if c == Some('(') {
            return self.arith_parse_cmdsub();
        }
        if c == Some('{') {
            return self.arith_parse_braced_param();
        }
        let mut name = String::new();
        while let Some(ch) = self.arith_peek(0) {
            if ch.is_alphanumeric() || ch == '_' {
                name.push(self.arith_advance());
            } else if (lexer_special(ch) || ch == '#') && name.is_empty() {
                name.push(self.arith_advance());
                break;
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(ParseError::at(
                "Expected variable name after $",
                self.arith_pos,
            ));
        }
        Ok(Node::ParamExpansion(ParamExpansion {
            param: name,
            op: String::new(),
            arg: String::new(),
        }))
    }

    fn arith_parse_cmdsub(&mut self) -> Result<Node, ParseError> {
        self.arith_advance();
        if self.arith_peek_is(0, '(') {
            // `$((` inside arithmetic is a nested arithmetic expansion.
            self.arith_advance();
            let mut depth = 1;
            let content_start = self.arith_pos;
            while !self.arith_at_end() && depth > 0 {
                match self.arith_peek(0) {
                    Some('(') => {
                        depth += 1;
                        self.arith_advance();
                    }
                    Some(')') => {
                        if depth == 1 && self.arith_peek_is(1, ')') {
                            break;
                        }
                        depth -= 1;
                        self.arith_advance();
                    }
                    _ => {
                        self.arith_advance();
                    }
                }
            }
            let content: String = self.arith_src[content_start..self.arith_pos].iter().collect();
            self.arith_advance();
            self.arith_advance();
            let inner = self.parse_arith_expr(&content)?;
            return Ok(Node::ArithmeticExpansion(
                crate::ast::ArithmeticExpansion {
                    expression: inner.map(Box::new),
                },
            ));
        }
        let mut depth = 1;
        let content_start = self.arith_pos;
        while !self.arith_at_end() && depth > 0 {
            match self.arith_peek(0) {
                Some('(') => {
                    depth += 1;
                    self.arith_advance();
                }
                Some(')') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    self.arith_advance();
                }
                _ => {
                    self.arith_advance();
                }
            }
        }
        let content: String = self.arith_src[content_start..self.arith_pos].iter().collect();
        self.arith_advance();
        let mut sub = Self::subparser(&content, false, self.extglob);
        let cmd = sub.parse_list(true)?.unwrap_or(Node::Empty);
        Ok(Node::CommandSubstitution(CommandSubstitution {
            command: Box::new(cmd),
            brace: false,
        }))
    }

    fn arith_parse_braced_param(&mut self) -> Result<Node, ParseError> {
        self.arith_advance();
        if self.arith_peek_is(0, '!') {
            self.arith_advance();
            let mut name = String::new();
            while !self.arith_at_end() && !self.arith_peek_is(0, '}') {
                name.push(self.arith_advance());
            }
            self.arith_consume("}");
            return Ok(Node::ParamIndirect(ParamIndirect {
                param: name,
                op: String::new(),
                arg: String::new(),
            }));
        }
        if self.arith_peek_is(0, '#') {
            self.arith_advance();
            let mut name = String::new();
            while !self.arith_at_end() && !self.arith_peek_is(0, '}') {
                name.push(self.arith_advance());
            }
            self.arith_consume("}");
            return Ok(Node::ParamLength(ParamLength { param: name }));
        }
        let mut name = String::new();
        loop {
            let Some(ch) = self.arith_peek(0) else {
                break;
            };
            if ch == '}' {
                self.arith_advance();
                return Ok(Node::ParamExpansion(ParamExpansion {
                    param: name,
                    op: String::new(),
                    arg: String::new(),
                }));
            }
            if is_param_expansion_op(ch) {
                break;
            }
            name.push(self.arith_advance());
        }
        let mut op_str = String::new();
        let mut depth = 1;
        while !self.arith_at_end() && depth > 0 {
            match self.arith_peek(0) {
                Some('{') => {
                    depth += 1;
                    op_str.push(self.arith_advance());
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    op_str.push(self.arith_advance());
                }
                _ => {
                    op_str.push(self.arith_advance());
                }
            }
        }
        self.arith_consume("}");
        const OPS: [&str; 11] = [
            ":-", ":=", ":+", ":?", ":", "##", "#", "%%", "%", "//", "/",
        ];
        for op in OPS {
            if let Some(rest) = op_str.strip_prefix(op) {
                return Ok(Node::ParamExpansion(ParamExpansion {
                    param: name,
                    op: op.to_string(),
                    arg: rest.to_string(),
                }));
            }
        }
        Ok(Node::ParamExpansion(ParamExpansion {
            param: name,
            op: String::new(),
            arg: op_str,
        }))
    }

    fn arith_parse_single_quote(&mut self) -> Result<Node, ParseError> {
        self.arith_advance();
        let content_start = self.arith_pos;
        while !self.arith_at_end() && !self.arith_peek_is(0, '\'') {
            self.arith_advance();
        }
        let content: String = self.arith_src[content_start..self.arith_pos].iter().collect();
        if !self.arith_consume("'") {
            return Err(ParseError::at(
                "Unterminated single quote in arithmetic",
                self.arith_pos,
            ));
        }
        Ok(Node::ArithNumber(content))
    }

    fn arith_parse_double_quote(&mut self) -> Result<Node, ParseError> {
        self.arith_advance();
        let content_start = self.arith_pos;
        while !self.arith_at_end() && !self.arith_peek_is(0, '"') {
            if self.arith_peek_is(0, '\\') {
                self.arith_advance();
                self.arith_advance();
            } else {
                self.arith_advance();
            }
        }
        let content: String = self.arith_src[content_start..self.arith_pos].iter().collect();
        if !self.arith_consume("\"") {
            return Err(ParseError::at(
                "Unterminated double quote in arithmetic",
                self.arith_pos,
            ));
        }
        Ok(Node::ArithNumber(content))
    }

    fn arith_parse_backtick(&mut self) -> Result<Node, ParseError> {
        self.arith_advance();
        let content_start = self.arith_pos;
        while !self.arith_at_end() && !self.arith_peek_is(0, '`') {
            if self.arith_peek_is(0, '\\') {
                self.arith_advance();
                self.arith_advance();
            } else {
                self.arith_advance();
            }
        }
        let content: String = self.arith_src[content_start..self.arith_pos].iter().collect();
        if !self.arith_consume("`") {
            return Err(ParseError::at(
                "Unterminated backtick in arithmetic",
                self.arith_pos,
            ));
        }
        let mut sub = Self::subparser(&content, false, self.extglob);
        let cmd = sub.parse_list(true)?.unwrap_or(Node::Empty);
        Ok(Node::CommandSubstitution(CommandSubstitution {
            command: Box::new(cmd),
            brace: false,
        }))
    }

    fn arith_parse_number_or_var(&mut self) -> Result<Node, ParseError> {
        self.arith_skip_ws();
        let c = self.arith_peek(0).unwrap_or('\0');
        if c.is_ascii_digit() {
            let mut text = String::new();
            while let Some(ch) = self.arith_peek(0) {
                if ch.is_alphanumeric() || ch == '#' || ch == '_' {
                    text.push(self.arith_advance());
                } else {
                    break;
                }
            }
            // `12$x` concatenates; bash treats the fragments as one operand.
            if self.arith_peek_is(0, '$') {
                let expansion = self.arith_parse_expansion()?;
                return Ok(Node::ArithConcat(vec![Node::ArithNumber(text), expansion]));
            }
            return Ok(Node::ArithNumber(text));
        }
        if c.is_alphabetic() || c == '_' {
            let mut name = String::new();
            while let Some(ch) = self.arith_peek(0) {
                if ch.is_alphanumeric() || ch == '_' {
                    name.push(self.arith_advance());
                } else {
                    break;
                }
            }
            return Ok(Node::ArithVar(name));
        }
        Err(ParseError::at(
            format!("Unexpected character '{c}' in arithmetic expression"),
            self.arith_pos,
        ))
    }
}

fn lexer_special(c: char) -> bool {
    crate::lexer::is_special_param(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn arith_sexp(content: &str) -> String {
        let mut p = Parser::subparser("", false, true);
        p.parse_arith_expr(content)
            .expect("arith parse")
            .map_or_else(String::new, |n| n.to_sexp())
    }

    #[test]
    fn precedence_mul_over_add() {
        assert_eq!(
            arith_sexp("1 + 2 * 3"),
            "(binary-op \"+\" (number \"1\") (binary-op \"*\" (number \"2\") (number \"3\")))"
        );
    }

    #[test]
    fn exponent_is_right_associative() {
        assert_eq!(
            arith_sexp("2**3**2"),
            "(binary-op \"**\" (number \"2\") (binary-op \"**\" (number \"3\") (number \"2\")))"
        );
    }

    #[test]
    fn assignment_over_ternary() {
        assert_eq!(
            arith_sexp("x = y ? 1 : 2"),
            "(assign \"=\" (var \"x\") (ternary (var \"y\") (number \"1\") (number \"2\")))"
        );
    }

    #[test]
    fn comma_is_lowest() {
        assert_eq!(
            arith_sexp("a=1, b=2"),
            "(comma (assign \"=\" (var \"a\") (number \"1\")) (assign \"=\" (var \"b\") (number \"2\")))"
        );
    }

    #[test]
    fn postfix_and_prefix() {
        assert_eq!(arith_sexp("x++"), "(post-incr (var \"x\"))");
        assert_eq!(arith_sexp("--x"), "(pre-decr (var \"x\"))");
    }

    #[test]
    fn subscript_only_on_variables() {
        assert_eq!(
            arith_sexp("a[i+1]"),
            "(subscript \"a\" (binary-op \"+\" (var \"i\") (number \"1\")))"
        );
    }

    #[test]
    fn number_bases_kept_raw() {
        assert_eq!(arith_sexp("0x1f"), "(number \"0x1f\")");
        assert_eq!(arith_sexp("16#ff"), "(number \"16#ff\")");
    }

    #[test]
    fn expansion_operand() {
        assert_eq!(arith_sexp("$x + 1"), "(binary-op \"+\" (param \"x\") (number \"1\"))");
        assert_eq!(arith_sexp("${x:-0}"), "(param \"x\" \":-\" \"0\")");
    }

    #[test]
    fn empty_ternary_branches() {
        assert_eq!(
            arith_sexp("1 ? : 2"),
            "(ternary (number \"1\") (empty) (number \"2\"))"
        );
    }

    #[test]
    fn concatenated_number_and_expansion() {
        assert_eq!(
            arith_sexp("12$x"),
            "(arith-concat (number \"12\") (param \"x\"))"
        );
    }

    #[test]
    fn unmatched_paren_is_fatal() {
        let mut p = Parser::subparser("", false, true);
        assert!(p.parse_arith_expr("(1 + 2").is_err());
    }
}
