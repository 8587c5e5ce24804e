//! Sandboxed boolean expression language for `dsl` matchers.
//!
//! Supported: string/integer/bool literals, `status_code` and `body`
//! variables, `contains(haystack, needle)`, `len(x)`, `header(name)`,
//! comparisons, `&& || !`, and parentheses. Evaluation is pure — no I/O —
//! and bounded by an expression length cap and a recursion depth cap, so a
//! hostile probe cannot burn CPU here.

use std::fmt;

/// Longest accepted expression, in bytes.
const MAX_EXPR_LEN: usize = 1024;

/// Maximum nesting depth for the parser.
const MAX_DEPTH: usize = 32;

/// Response fields visible to an expression.
pub struct DslContext<'a> {
    pub status_code: u16,
    pub body: &'a str,
    pub headers: &'a [(String, String)],
}

impl DslContext<'_> {
    fn header(&self, name: &str) -> String {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }
}

/// Evaluate an expression against a response. Any parse or type error is
/// returned as a message; callers treat it as a non-match.
pub fn eval(expr: &str, ctx: &DslContext) -> Result<bool, DslError> {
    if expr.len() > MAX_EXPR_LEN {
        return Err(DslError(format!("expression longer than {MAX_EXPR_LEN} bytes")));
    }
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let ast = parser.expr(0)?;
    if parser.pos != tokens.len() {
        return Err(DslError("trailing tokens after expression".into()));
    }
    match ast.eval(ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(DslError(format!("expression yields {}, not a boolean", other.type_name()))),
    }
}

#[derive(Debug)]
pub struct DslError(pub String);

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
    Bang,
    Op(&'static str),
}

fn tokenize(input: &str) -> Result<Vec<Token>, DslError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err(DslError("unterminated string literal".into()));
                    };
                    i += 1;
                    if c == quote {
                        break;
                    }
                    if c == '\\' {
                        let Some(&escaped) = chars.get(i) else {
                            return Err(DslError("dangling escape".into()));
                        };
                        i += 1;
                        s.push(escaped);
                    } else {
                        s.push(c);
                    }
                }
                tokens.push(Token::Str(s));
            }
            '&' | '|' => {
                if chars.get(i + 1) == Some(&c) {
                    tokens.push(Token::Op(if c == '&' { "&&" } else { "||" }));
                    i += 2;
                } else {
                    return Err(DslError(format!("unexpected `{c}`")));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    return Err(DslError("unexpected `=`, did you mean `==`?".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' | '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(if c == '<' { "<=" } else { ">=" }));
                    i += 2;
                } else {
                    tokens.push(Token::Op(if c == '<' { "<" } else { ">" }));
                    i += 1;
                }
            }
            '0'..='9' => {
                let start = i;
                while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse().map_err(|_| DslError(format!("bad integer `{text}`")))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(DslError(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (recursive descent, depth-capped)
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Ast {
    Literal(Value),
    Var(String),
    Call(String, Vec<Ast>),
    Not(Box<Ast>),
    Binary(&'static str, Box<Ast>, Box<Ast>),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), DslError> {
        match self.bump() {
            Some(ref t) if t == token => Ok(()),
            other => Err(DslError(format!("expected {token:?}, found {other:?}"))),
        }
    }

    fn check_depth(depth: usize) -> Result<(), DslError> {
        if depth > MAX_DEPTH {
            Err(DslError("expression nests too deeply".into()))
        } else {
            Ok(())
        }
    }

    fn expr(&mut self, depth: usize) -> Result<Ast, DslError> {
        Self::check_depth(depth)?;
        let mut lhs = self.and_expr(depth + 1)?;
        while matches!(self.peek(), Some(Token::Op("||"))) {
            self.bump();
            let rhs = self.and_expr(depth + 1)?;
            lhs = Ast::Binary("||", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self, depth: usize) -> Result<Ast, DslError> {
        Self::check_depth(depth)?;
        let mut lhs = self.cmp_expr(depth + 1)?;
        while matches!(self.peek(), Some(Token::Op("&&"))) {
            self.bump();
            let rhs = self.cmp_expr(depth + 1)?;
            lhs = Ast::Binary("&&", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self, depth: usize) -> Result<Ast, DslError> {
        Self::check_depth(depth)?;
        let lhs = self.term(depth + 1)?;
        if let Some(Token::Op(op @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) = self.peek() {
            let op = *op;
            self.bump();
            let rhs = self.term(depth + 1)?;
            return Ok(Ast::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn term(&mut self, depth: usize) -> Result<Ast, DslError> {
        Self::check_depth(depth)?;
        match self.bump() {
            Some(Token::Bang) => Ok(Ast::Not(Box::new(self.term(depth + 1)?))),
            Some(Token::LParen) => {
                let inner = self.expr(depth + 1)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Int(n)) => Ok(Ast::Literal(Value::Int(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::Str(s))),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.expr(depth + 1)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.bump();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Ast::Call(name, args))
                } else {
                    match name.as_str() {
                        "true" => Ok(Ast::Literal(Value::Bool(true))),
                        "false" => Ok(Ast::Literal(Value::Bool(false))),
                        _ => Ok(Ast::Var(name)),
                    }
                }
            }
            other => Err(DslError(format!("unexpected token {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Ast {
    fn eval(&self, ctx: &DslContext) -> Result<Value, DslError> {
        match self {
            Ast::Literal(v) => Ok(v.clone()),
            Ast::Var(name) => match name.as_str() {
                "status_code" => Ok(Value::Int(ctx.status_code as i64)),
                "body" => Ok(Value::Str(ctx.body.to_string())),
                other => Err(DslError(format!("unknown variable `{other}`"))),
            },
            Ast::Call(name, args) => eval_call(name, args, ctx),
            Ast::Not(inner) => match inner.eval(ctx)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(DslError(format!("`!` applied to {}", other.type_name()))),
            },
            Ast::Binary(op, lhs, rhs) => eval_binary(op, lhs, rhs, ctx),
        }
    }
}

fn eval_call(name: &str, args: &[Ast], ctx: &DslContext) -> Result<Value, DslError> {
    match name {
        "contains" => {
            let [haystack, needle] = args else {
                return Err(DslError("contains() takes two arguments".into()));
            };
            match (haystack.eval(ctx)?, needle.eval(ctx)?) {
                (Value::Str(h), Value::Str(n)) => Ok(Value::Bool(h.contains(&n))),
                (h, n) => Err(DslError(format!(
                    "contains() takes strings, got {} and {}",
                    h.type_name(),
                    n.type_name()
                ))),
            }
        }
        "len" => {
            let [arg] = args else {
                return Err(DslError("len() takes one argument".into()));
            };
            match arg.eval(ctx)? {
                Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                other => Err(DslError(format!("len() takes a string, got {}", other.type_name()))),
            }
        }
        "header" => {
            let [arg] = args else {
                return Err(DslError("header() takes one argument".into()));
            };
            match arg.eval(ctx)? {
                Value::Str(name) => Ok(Value::Str(ctx.header(&name))),
                other => {
                    Err(DslError(format!("header() takes a string, got {}", other.type_name())))
                }
            }
        }
        other => Err(DslError(format!("unknown function `{other}`"))),
    }
}

fn eval_binary(op: &str, lhs: &Ast, rhs: &Ast, ctx: &DslContext) -> Result<Value, DslError> {
    // Logical operators short-circuit; comparisons evaluate both sides.
    match op {
        "&&" | "||" => {
            let l = match lhs.eval(ctx)? {
                Value::Bool(b) => b,
                other => return Err(DslError(format!("`{op}` applied to {}", other.type_name()))),
            };
            if (op == "&&" && !l) || (op == "||" && l) {
                return Ok(Value::Bool(l));
            }
            match rhs.eval(ctx)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(DslError(format!("`{op}` applied to {}", other.type_name()))),
            }
        }
        _ => {
            let l = lhs.eval(ctx)?;
            let r = rhs.eval(ctx)?;
            let ordering = match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (Value::Bool(a), Value::Bool(b)) if matches!(op, "==" | "!=") => a.cmp(b),
                _ => {
                    return Err(DslError(format!(
                        "cannot compare {} with {}",
                        l.type_name(),
                        r.type_name()
                    )))
                }
            };
            let result = match op {
                "==" => ordering.is_eq(),
                "!=" => !ordering.is_eq(),
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => return Err(DslError(format!("unknown operator `{op}`"))),
            };
            Ok(Value::Bool(result))
        }
    }
}
