// Expression parser - converts setting formulas into an AST
// Supports: int/float/string literals, True/False/None, list literals, bare setting identifiers,
// dotted constants (math.pi), function calls, subscripts, arithmetic (+ - * / // % **),
// chained comparisons, `in`, and/or/not, and the `a if cond else b` conditional.

use std::sync::Arc;

use crate::error::EvalError;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier: a setting key, or a dotted registry constant.
    Name(String),
    List(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `a < b <= c` chains like `a < b and b <= c`.
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Lt,    // <
    LtEq,  // <=
    Gt,    // >
    GtEq,  // >=
    Eq,    // ==
    NotEq, // !=
    In,    // in
    NotIn, // not in
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// A parsed formula. Cheap to clone; parsed once when a container or
/// definition is built and evaluated any number of times afterwards.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    ast: Arc<Expr>,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }
}

impl PartialEq for CompiledExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Deepest expression tree a formula may build. Bounds recursion in the
/// parser and in every walk over the tree.
pub const MAX_DEPTH: usize = 100;

/// Longest formula, in tokens.
pub const MAX_TOKENS: usize = 4096;

/// Parse a formula string. A single leading `=` (profile-file convention) is
/// accepted and stripped.
pub fn parse(source: &str) -> Result<CompiledExpression, EvalError> {
    let trimmed = source.trim();
    let body = trimmed.strip_prefix('=').unwrap_or(trimmed);

    let tokens = tokenize(body).map_err(|msg| EvalError::syntax(body, msg))?;
    if tokens.is_empty() {
        return Err(EvalError::syntax(body, "empty expression"));
    }

    if tokens.len() > MAX_TOKENS {
        return Err(EvalError::syntax(body, format!("expression longer than {} tokens", MAX_TOKENS)));
    }

    let mut parser = Parser {
        tokens: &tokens,
        depth: 0,
    };
    let (expr, pos) = parser.parse_conditional(0).map_err(|msg| EvalError::syntax(body, msg))?;
    if pos != tokens.len() {
        return Err(EvalError::syntax(body, format!("unexpected token {:?} at position {}", tokens[pos], pos)));
    }
    // Operator chains (`a + b + ...`) grow the tree without recursing in the parser.
    if expr_depth(&expr) > MAX_DEPTH {
        return Err(EvalError::syntax(body, format!("expression nested deeper than {} levels", MAX_DEPTH)));
    }

    Ok(CompiledExpression {
        source: Arc::from(body),
        ast: Arc::new(expr),
    })
}

/// Height of the tree, computed without recursion.
fn expr_depth(root: &Expr) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(root, 1)];
    while let Some((expr, depth)) = pending.pop() {
        deepest = deepest.max(depth);
        let below = depth + 1;
        match expr {
            Expr::Literal(_) | Expr::Name(_) => {}
            Expr::List(items) | Expr::Call { args: items, .. } => {
                pending.extend(items.iter().map(|e| (e, below)));
            }
            Expr::Unary { operand, .. } => pending.push((operand.as_ref(), below)),
            Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                pending.push((left.as_ref(), below));
                pending.push((right.as_ref(), below));
            }
            Expr::Compare { first, rest } => {
                pending.push((first.as_ref(), below));
                pending.extend(rest.iter().map(|(_, e)| (e, below)));
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                pending.push((condition.as_ref(), below));
                pending.push((then.as_ref(), below));
                pending.push((otherwise.as_ref(), below));
            }
            Expr::Index { target, index } => {
                pending.push((target.as_ref(), below));
                pending.push((index.as_ref(), below));
            }
        }
    }
    deepest
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    // Keywords
    And,
    Or,
    Not,
    If,
    Else,
    In,
    True,
    False,
    None,
    // Punctuation
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Lt,
    LtEq,
    Gt,
    GtEq,
    EqEq,
    NotEq,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => { chars.next(); }
            '+' => { tokens.push(Token::Plus); chars.next(); }
            '-' => { tokens.push(Token::Minus); chars.next(); }
            '%' => { tokens.push(Token::Percent); chars.next(); }
            '(' => { tokens.push(Token::LParen); chars.next(); }
            ')' => { tokens.push(Token::RParen); chars.next(); }
            '[' => { tokens.push(Token::LBracket); chars.next(); }
            ']' => { tokens.push(Token::RBracket); chars.next(); }
            ',' => { tokens.push(Token::Comma); chars.next(); }
            '*' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::DoubleStar);
                } else {
                    tokens.push(Token::Star);
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    tokens.push(Token::DoubleSlash);
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("single '=' is not an operator (use '==')".to_string());
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("unexpected character: !".to_string());
                }
                tokens.push(Token::NotEq);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next(); // consume opening quote
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(ch) => s.push(ch),
                            None => return Err("unterminated string literal".to_string()),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                // Dotted names (math.ceil, math.pi): consume .ident segments
                while chars.peek() == Some(&'.') {
                    let mut lookahead = chars.clone();
                    lookahead.next(); // skip '.'
                    match lookahead.peek() {
                        Some(&ch) if ch.is_ascii_alphabetic() || ch == '_' => {
                            chars.next(); // consume '.'
                            ident.push('.');
                            while let Some(&ch) = chars.peek() {
                                if ch.is_ascii_alphanumeric() || ch == '_' {
                                    ident.push(ch);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                        }
                        _ => break,
                    }
                }

                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "in" => Token::In,
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    "None" => Token::None,
                    _ => Token::Ident(ident),
                });
            }
            '0'..='9' | '.' => {
                let mut num_str = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        num_str.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        num_str.push(d);
                        chars.next();
                    } else if (d == 'e' || d == 'E') && !num_str.is_empty() {
                        // Exponent: 1e-3, 2.5E4
                        is_float = true;
                        num_str.push(d);
                        chars.next();
                        if let Some(&sign) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                num_str.push(sign);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                if is_float {
                    let num: f64 = num_str.parse().map_err(|_| format!("invalid number: {}", num_str))?;
                    tokens.push(Token::Float(num));
                } else {
                    let num: i64 = num_str.parse().map_err(|_| format!("invalid number: {}", num_str))?;
                    tokens.push(Token::Int(num));
                }
            }
            _ => return Err(format!("unexpected character: {}", c)),
        }
    }

    Ok(tokens)
}

struct Parser<'t> {
    tokens: &'t [Token],
    depth: usize,
}

impl Parser<'_> {
    /// Count one level of recursion; formulas nested deeper than
    /// [`MAX_DEPTH`] are rejected instead of exhausting the stack.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("expression nested deeper than {} levels", MAX_DEPTH));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // Lowest precedence: `a if cond else b` (right-associative)
    fn parse_conditional(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (then, pos) = self.parse_or(pos)?;

        if self.tokens.get(pos) != Some(&Token::If) {
            return Ok((then, pos));
        }
        let (condition, pos) = self.parse_or(pos + 1)?;
        if self.tokens.get(pos) != Some(&Token::Else) {
            return Err("expected 'else' in conditional expression".to_string());
        }
        let (otherwise, pos) = self.nested(|p| p.parse_conditional(pos + 1))?;

        Ok((
            Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            pos,
        ))
    }

    fn parse_or(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (mut left, mut pos) = self.parse_and(pos)?;

        while self.tokens.get(pos) == Some(&Token::Or) {
            let (right, new_pos) = self.parse_and(pos + 1)?;
            left = Expr::Or(Box::new(left), Box::new(right));
            pos = new_pos;
        }

        Ok((left, pos))
    }

    fn parse_and(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (mut left, mut pos) = self.parse_not(pos)?;

        while self.tokens.get(pos) == Some(&Token::And) {
            let (right, new_pos) = self.parse_not(pos + 1)?;
            left = Expr::And(Box::new(left), Box::new(right));
            pos = new_pos;
        }

        Ok((left, pos))
    }

    fn parse_not(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        if self.tokens.get(pos) == Some(&Token::Not) {
            let (operand, pos) = self.nested(|p| p.parse_not(pos + 1))?;
            return Ok((
                Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                pos,
            ));
        }
        self.parse_comparison(pos)
    }

    fn parse_comparison(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (first, mut pos) = self.parse_additive(pos)?;
        let mut rest = Vec::new();

        loop {
            let (op, width) = match (self.tokens.get(pos), self.tokens.get(pos + 1)) {
                (Some(Token::Lt), _) => (CmpOp::Lt, 1),
                (Some(Token::LtEq), _) => (CmpOp::LtEq, 1),
                (Some(Token::Gt), _) => (CmpOp::Gt, 1),
                (Some(Token::GtEq), _) => (CmpOp::GtEq, 1),
                (Some(Token::EqEq), _) => (CmpOp::Eq, 1),
                (Some(Token::NotEq), _) => (CmpOp::NotEq, 1),
                (Some(Token::In), _) => (CmpOp::In, 1),
                (Some(Token::Not), Some(Token::In)) => (CmpOp::NotIn, 2),
                _ => break,
            };
            let (right, new_pos) = self.parse_additive(pos + width)?;
            rest.push((op, right));
            pos = new_pos;
        }

        if rest.is_empty() {
            Ok((first, pos))
        } else {
            Ok((
                Expr::Compare {
                    first: Box::new(first),
                    rest,
                },
                pos,
            ))
        }
    }

    fn parse_additive(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (mut left, mut pos) = self.parse_term(pos)?;

        loop {
            let op = match self.tokens.get(pos) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            let (right, new_pos) = self.parse_term(pos + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
            pos = new_pos;
        }

        Ok((left, pos))
    }

    fn parse_term(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (mut left, mut pos) = self.parse_unary(pos)?;

        loop {
            let op = match self.tokens.get(pos) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            let (right, new_pos) = self.parse_unary(pos + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
            pos = new_pos;
        }

        Ok((left, pos))
    }

    fn parse_unary(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let op = match self.tokens.get(pos) {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Pos,
            _ => return self.parse_power(pos),
        };
        let (operand, pos) = self.nested(|p| p.parse_unary(pos + 1))?;
        Ok((
            Expr::Unary {
                op,
                operand: Box::new(operand),
            },
            pos,
        ))
    }

    // Exponentiation (**) - right-associative, binds tighter than unary minus on its left
    fn parse_power(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (base, pos) = self.parse_postfix(pos)?;

        if self.tokens.get(pos) == Some(&Token::DoubleStar) {
            // -2 ** 2 == -(2 ** 2), but 2 ** -1 is allowed: exponent parses as unary
            let (exponent, new_pos) = self.nested(|p| p.parse_unary(pos + 1))?;
            return Ok((
                Expr::Binary {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
                new_pos,
            ));
        }

        Ok((base, pos))
    }

    // Calls and subscripts
    fn parse_postfix(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let (mut expr, mut pos) = self.parse_primary(pos)?;

        loop {
            match self.tokens.get(pos) {
                Some(Token::LParen) => {
                    let name = match &expr {
                        Expr::Name(name) => name.clone(),
                        _ => return Err("only named functions can be called".to_string()),
                    };
                    let (args, new_pos) = self.nested(|p| p.parse_sequence(pos + 1, Token::RParen))?;
                    expr = Expr::Call { name, args };
                    pos = new_pos;
                }
                Some(Token::LBracket) => {
                    let (index, new_pos) = self.nested(|p| p.parse_conditional(pos + 1))?;
                    if self.tokens.get(new_pos) != Some(&Token::RBracket) {
                        return Err("expected ']' after subscript".to_string());
                    }
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                    pos = new_pos + 1;
                }
                _ => break,
            }
        }

        Ok((expr, pos))
    }

    fn parse_primary(&mut self, pos: usize) -> Result<(Expr, usize), String> {
        let Some(token) = self.tokens.get(pos) else {
            return Err("unexpected end of expression".to_string());
        };

        match token {
            Token::Int(n) => Ok((Expr::Literal(Value::Int(*n)), pos + 1)),
            Token::Float(n) => Ok((Expr::Literal(Value::Float(*n)), pos + 1)),
            Token::Str(s) => Ok((Expr::Literal(Value::String(s.clone())), pos + 1)),
            Token::True => Ok((Expr::Literal(Value::Bool(true)), pos + 1)),
            Token::False => Ok((Expr::Literal(Value::Bool(false)), pos + 1)),
            Token::None => Ok((Expr::Literal(Value::Undefined), pos + 1)),
            Token::Ident(name) => Ok((Expr::Name(name.clone()), pos + 1)),
            Token::LParen => {
                let (expr, pos) = self.nested(|p| p.parse_conditional(pos + 1))?;
                match self.tokens.get(pos) {
                    Some(Token::RParen) => Ok((expr, pos + 1)),
                    Some(_) => Err("expected closing parenthesis".to_string()),
                    None => Err("missing closing parenthesis".to_string()),
                }
            }
            Token::LBracket => {
                let (items, pos) = self.nested(|p| p.parse_sequence(pos + 1, Token::RBracket))?;
                Ok((Expr::List(items), pos))
            }
            other => Err(format!("unexpected token {:?} at position {}", other, pos)),
        }
    }

    /// Comma-separated expressions up to `close` (call arguments, list items).
    /// A trailing comma is accepted.
    fn parse_sequence(&mut self, pos: usize, close: Token) -> Result<(Vec<Expr>, usize), String> {
        let mut items = Vec::new();
        let mut pos = pos;

        if self.tokens.get(pos) == Some(&close) {
            return Ok((items, pos + 1));
        }

        loop {
            let (item, new_pos) = self.parse_conditional(pos)?;
            items.push(item);
            pos = new_pos;

            match self.tokens.get(pos) {
                Some(t) if *t == close => return Ok((items, pos + 1)),
                Some(Token::Comma) => {
                    pos += 1;
                    if self.tokens.get(pos) == Some(&close) {
                        return Ok((items, pos + 1));
                    }
                }
                Some(_) => return Err("expected comma or closing bracket".to_string()),
                None => return Err("missing closing bracket".to_string()),
            }
        }
    }
}
