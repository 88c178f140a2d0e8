use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use super::{
    Aggregate, AggregateFunc, BinaryOp, Binding, Comprehension, ComprehensionKind, Expr, IsOp,
    ObjectComprehension, Quantified, QuantifierKind, SortTerm, WindowSpec,
};
use crate::algebra::{
    FromTerm, GroupBy, JoinCondition, JoinHint, JoinTerm, KeyspaceTerm, Projection, ResultTerm,
    Select, SelectBody, SetOp, SetOpKind, Subselect, UnnestTerm, WithBinding,
};
use crate::error::{PlanError, Result};

/// Parses canonical (or hand-written) expression text.
pub fn parse(text: &str) -> Result<Expr> {
    let tokens = lex(text).map_err(|reason| PlanError::expr_parse(text, reason))?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .expr()
        .and_then(|expr| match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(format!("unexpected trailing {other:?}")),
        })
        .map_err(|reason| PlanError::expr_parse(text, reason))?;
    Ok(expr)
}

/// Parses the text form of a SELECT produced by its `Display` implementation.
pub fn parse_select(text: &str) -> Result<Select> {
    let tokens = lex(text).map_err(|reason| PlanError::expr_parse(text, reason))?;
    let mut parser = Parser { tokens, pos: 0 };
    let select = parser
        .select()
        .and_then(|select| match parser.peek() {
            Token::Eof => Ok(select),
            other => Err(format!("unexpected trailing {other:?}")),
        })
        .map_err(|reason| PlanError::expr_parse(text, reason))?;
    Ok(select)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Num(Number),
    Named(String),
    Positional(usize),
    Sym(&'static str),
    Eof,
}

const SYMBOLS: &[&str] = &[
    "<=", ">=", "!=", "<>", "==", "||", "(", ")", "[", "]", "{", "}", ",", ".", ":", "*", "+",
    "-", "/", "%", "=", "<", ">",
];

fn lex(text: &str) -> std::result::Result<Vec<Token>, String> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == '`' {
            let (name, next) = lex_quoted(text, i, '`')?;
            tokens.push(Token::Quoted(name));
            i = next;
            continue;
        }
        if c == '\'' {
            let (s, next) = lex_quoted(text, i, '\'')?;
            tokens.push(Token::Str(s));
            i = next;
            continue;
        }
        if c == '"' {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            if i >= bytes.len() {
                return Err("unterminated string".into());
            }
            i += 1;
            let s: String = serde_json::from_str(&text[start..i])
                .map_err(|err| format!("bad string literal: {err}"))?;
            tokens.push(Token::Str(s));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            match serde_json::from_str::<Value>(&text[start..i]) {
                Ok(Value::Number(n)) => tokens.push(Token::Num(n)),
                _ => return Err(format!("bad number '{}'", &text[start..i])),
            }
            continue;
        }
        if c == '$' {
            let start = i + 1;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let name = &text[start..i];
            if name.is_empty() {
                return Err("empty parameter name".into());
            }
            match name.parse::<usize>() {
                Ok(pos) => tokens.push(Token::Positional(pos)),
                Err(_) => tokens.push(Token::Named(name.to_string())),
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Word(text[start..i].to_string()));
            continue;
        }
        match SYMBOLS.iter().find(|sym| text[i..].starts_with(**sym)) {
            Some(sym) => {
                tokens.push(Token::Sym(*sym));
                i += sym.len();
            }
            None => {
                let ch = text[i..].chars().next().unwrap_or(c);
                return Err(format!("unexpected character '{ch}'"));
            }
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

/// Reads a `quote`-delimited token starting at `start`; doubled quotes escape.
fn lex_quoted(text: &str, start: usize, quote: char) -> std::result::Result<(String, usize), String> {
    let mut out = String::new();
    let mut chars = text[start + 1..].char_indices().peekable();
    while let Some((offset, ch)) = chars.next() {
        if ch == quote {
            if let Some((_, next)) = chars.peek() {
                if *next == quote {
                    out.push(quote);
                    chars.next();
                    continue;
                }
            }
            return Ok((out, start + 1 + offset + ch.len_utf8()));
        }
        out.push(ch);
    }
    Err(format!("unterminated {quote}-quoted token"))
}

static EOF: Token = Token::Eof;

type PResult<T> = std::result::Result<T, String>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&EOF)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn is_keyword_at(&self, offset: usize, keyword: &str) -> bool {
        matches!(self.peek_at(offset), Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword_at(0, keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> PResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected '{keyword}', found {:?}", self.peek()))
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Token::Sym(s) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> PResult<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected '{sym}', found {:?}", self.peek()))
        }
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_keyword("not") {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.concat()?;
        if self.is_keyword_at(0, "is") {
            self.pos += 1;
            let negated = self.eat_keyword("not");
            let op = if self.eat_keyword("null") {
                if negated { IsOp::NotNull } else { IsOp::Null }
            } else if self.eat_keyword("missing") {
                if negated { IsOp::NotMissing } else { IsOp::Missing }
            } else if self.eat_keyword("valued") {
                if negated { IsOp::NotValued } else { IsOp::Valued }
            } else {
                return Err(format!("expected null, missing or valued after IS, found {:?}", self.peek()));
            };
            return Ok(Expr::Is(op, Box::new(left)));
        }
        let op = if self.is_keyword_at(0, "not") && self.is_keyword_at(1, "like") {
            self.pos += 2;
            BinaryOp::NotLike
        } else if self.is_keyword_at(0, "not") && self.is_keyword_at(1, "in") {
            self.pos += 2;
            BinaryOp::NotIn
        } else if self.eat_keyword("like") {
            BinaryOp::Like
        } else if self.eat_keyword("in") {
            BinaryOp::In
        } else if self.eat_sym("=") || self.eat_sym("==") {
            BinaryOp::Eq
        } else if self.eat_sym("!=") || self.eat_sym("<>") {
            BinaryOp::Ne
        } else if self.eat_sym("<=") {
            BinaryOp::Le
        } else if self.eat_sym(">=") {
            BinaryOp::Ge
        } else if self.eat_sym("<") {
            BinaryOp::Lt
        } else if self.eat_sym(">") {
            BinaryOp::Gt
        } else {
            return Ok(left);
        };
        let right = self.concat()?;
        Ok(Expr::binary(op, left, right))
    }

    fn concat(&mut self) -> PResult<Expr> {
        let mut left = self.additive()?;
        while self.eat_sym("||") {
            let right = self.additive()?;
            left = Expr::binary(BinaryOp::Concat, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_sym("+") {
                BinaryOp::Add
            } else if self.eat_sym("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_sym("*") {
                BinaryOp::Mul
            } else if self.eat_sym("/") {
                BinaryOp::Div
            } else if self.eat_sym("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.eat_sym("-") {
            let inner = self.unary()?;
            return Ok(match inner {
                Expr::Constant(Value::Number(n)) => match negate(&n) {
                    Some(neg) => Expr::Constant(Value::Number(neg)),
                    None => Expr::Negate(Box::new(Expr::Constant(Value::Number(n)))),
                },
                other => Expr::Negate(Box::new(other)),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Token::Sym(".")) && !matches!(self.peek_at(1), Token::Sym("*")) {
                self.pos += 1;
                let name = match self.advance() {
                    Token::Word(w) | Token::Quoted(w) => w,
                    other => return Err(format!("expected field name, found {other:?}")),
                };
                expr = Expr::field(expr, name);
            } else if self.eat_sym("[") {
                let index = self.expr()?;
                self.expect_sym("]")?;
                expr = Expr::Element(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> PResult<Expr> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Constant(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Constant(Value::String(s))),
            Token::Quoted(name) => Ok(Expr::ident(name)),
            Token::Named(name) => Ok(Expr::NamedParameter(name)),
            Token::Positional(pos) => Ok(Expr::PositionalParameter(pos)),
            Token::Sym("(") => {
                if self.is_keyword_at(0, "select") || self.is_keyword_at(0, "with") {
                    let select = self.select()?;
                    self.expect_sym(")")?;
                    return Ok(Expr::Subquery(Box::new(select)));
                }
                let inner = self.expr()?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Token::Sym("[") => {
                let items = self.list_until("]")?;
                Ok(fold_array(items))
            }
            Token::Sym("{") => self.object_construct(),
            Token::Word(word) => self.word(word),
            other => Err(format!("unexpected {other:?}")),
        }
    }

    fn list_until(&mut self, close: &str) -> PResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat_sym(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat_sym(close) {
                return Ok(items);
            }
            self.expect_sym(",")?;
        }
    }

    fn object_construct(&mut self) -> PResult<Expr> {
        let mut fields = BTreeMap::new();
        if !self.eat_sym("}") {
            loop {
                let key = match self.advance() {
                    Token::Str(s) | Token::Quoted(s) | Token::Word(s) => s,
                    other => return Err(format!("expected object key, found {other:?}")),
                };
                self.expect_sym(":")?;
                let value = self.expr()?;
                fields.insert(key, value);
                if self.eat_sym("}") {
                    break;
                }
                self.expect_sym(",")?;
            }
        }
        if fields.values().all(Expr::is_constant) && !fields.values().any(|v| *v == Expr::Missing) {
            let map: Map<String, Value> = fields
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Expr::Constant(value) => Some((k, value)),
                    _ => None,
                })
                .collect();
            return Ok(Expr::Constant(Value::Object(map)));
        }
        Ok(Expr::ObjectConstruct(fields))
    }

    fn word(&mut self, word: String) -> PResult<Expr> {
        let lower = word.to_ascii_lowercase();
        match lower.as_str() {
            "true" => return Ok(Expr::Constant(Value::Bool(true))),
            "false" => return Ok(Expr::Constant(Value::Bool(false))),
            "null" => return Ok(Expr::Constant(Value::Null)),
            "missing" => return Ok(Expr::Missing),
            "any" | "some" => {
                let kind = if self.is_keyword_at(0, "and") && self.is_keyword_at(1, "every") {
                    self.pos += 2;
                    QuantifierKind::AnyAndEvery
                } else {
                    QuantifierKind::Any
                };
                return self.quantified(kind);
            }
            "every" => return self.quantified(QuantifierKind::Every),
            "array" => return self.comprehension(ComprehensionKind::Array),
            "first" => return self.comprehension(ComprehensionKind::First),
            "object" => return self.object_comprehension(),
            _ => {}
        }
        if self.eat_sym("(") {
            if let Some(func) = AggregateFunc::from_name(&lower) {
                return self.aggregate(func);
            }
            let args = self.list_until(")")?;
            return Ok(Expr::Function(lower, args));
        }
        Ok(Expr::ident(word))
    }

    fn aggregate(&mut self, func: AggregateFunc) -> PResult<Expr> {
        let (operand, distinct) = if self.eat_sym("*") {
            (None, false)
        } else {
            let distinct = self.eat_keyword("distinct");
            (Some(Box::new(self.expr()?)), distinct)
        };
        self.expect_sym(")")?;
        let window = if self.eat_keyword("over") {
            Some(self.window()?)
        } else {
            None
        };
        Ok(Expr::Aggregate(Aggregate {
            func,
            operand,
            distinct,
            window,
        }))
    }

    fn window(&mut self) -> PResult<WindowSpec> {
        self.expect_sym("(")?;
        let mut spec = WindowSpec::default();
        if self.eat_keyword("partition") {
            self.expect_keyword("by")?;
            loop {
                spec.partition_by.push(self.expr()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                spec.order_by.push(self.sort_term()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym(")")?;
        Ok(spec)
    }

    fn sort_term(&mut self) -> PResult<SortTerm> {
        let expr = self.expr()?;
        let descending = if self.eat_keyword("desc") {
            true
        } else {
            self.eat_keyword("asc");
            false
        };
        let nulls_first = if self.eat_keyword("nulls") {
            if self.eat_keyword("first") {
                Some(true)
            } else {
                self.expect_keyword("last")?;
                Some(false)
            }
        } else {
            None
        };
        Ok(SortTerm {
            expr,
            descending,
            nulls_first,
        })
    }

    fn variable(&mut self) -> PResult<String> {
        match self.advance() {
            Token::Quoted(name) | Token::Word(name) => Ok(name),
            other => Err(format!("expected variable, found {other:?}")),
        }
    }

    fn bindings(&mut self) -> PResult<Vec<Binding>> {
        let mut out = Vec::new();
        loop {
            let first = self.variable()?;
            let (name_variable, variable) = if self.eat_sym(":") {
                (Some(first), self.variable()?)
            } else {
                (None, first)
            };
            let descend = if self.eat_keyword("within") {
                true
            } else {
                self.expect_keyword("in")?;
                false
            };
            let expr = self.expr()?;
            let mut binding = Binding::new(variable, expr);
            binding.name_variable = name_variable;
            binding.descend = descend;
            out.push(binding);
            if !self.eat_sym(",") {
                return Ok(out);
            }
        }
    }

    fn quantified(&mut self, kind: QuantifierKind) -> PResult<Expr> {
        let bindings = self.bindings()?;
        self.expect_keyword("satisfies")?;
        let satisfies = self.expr()?;
        self.expect_keyword("end")?;
        Ok(Expr::Quantified(Box::new(Quantified {
            kind,
            bindings,
            satisfies,
        })))
    }

    fn comprehension_tail(&mut self) -> PResult<(Vec<Binding>, Option<Expr>)> {
        self.expect_keyword("for")?;
        let bindings = self.bindings()?;
        let when = if self.eat_keyword("when") {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect_keyword("end")?;
        Ok((bindings, when))
    }

    fn comprehension(&mut self, kind: ComprehensionKind) -> PResult<Expr> {
        let mapping = self.expr()?;
        let (bindings, when) = self.comprehension_tail()?;
        Ok(Expr::Comprehension(Box::new(Comprehension {
            kind,
            mapping,
            bindings,
            when,
        })))
    }

    fn object_comprehension(&mut self) -> PResult<Expr> {
        let name_mapping = self.expr()?;
        self.expect_sym(":")?;
        let value_mapping = self.expr()?;
        let (bindings, when) = self.comprehension_tail()?;
        Ok(Expr::ObjectComprehension(Box::new(ObjectComprehension {
            name_mapping,
            value_mapping,
            bindings,
            when,
        })))
    }

    fn select(&mut self) -> PResult<Select> {
        let mut with = Vec::new();
        if self.eat_keyword("with") {
            loop {
                let alias = self.variable()?;
                self.expect_keyword("as")?;
                self.expect_sym("(")?;
                let expr = self.expr()?;
                self.expect_sym(")")?;
                with.push(WithBinding { alias, expr });
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        let body = self.select_body()?;
        let mut order = Vec::new();
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                order.push(self.sort_term()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        let offset = if self.eat_keyword("offset") {
            Some(self.expr()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("limit") {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Select {
            with,
            body,
            order,
            offset,
            limit,
        })
    }

    fn select_body(&mut self) -> PResult<SelectBody> {
        let mut body = SelectBody::Subselect(Box::new(self.subselect()?));
        loop {
            let kind = if self.eat_keyword("union") {
                SetOpKind::Union
            } else if self.eat_keyword("intersect") {
                SetOpKind::Intersect
            } else if self.eat_keyword("except") {
                SetOpKind::Except
            } else {
                return Ok(body);
            };
            let all = self.eat_keyword("all");
            let second = SelectBody::Subselect(Box::new(self.subselect()?));
            body = SelectBody::SetOp(Box::new(SetOp {
                kind,
                all,
                first: body,
                second,
            }));
        }
    }

    fn subselect(&mut self) -> PResult<Subselect> {
        self.expect_keyword("select")?;
        let distinct = self.eat_keyword("distinct");
        let raw = self.eat_keyword("raw");
        let mut terms = Vec::new();
        loop {
            terms.push(self.result_term()?);
            if !self.eat_sym(",") {
                break;
            }
        }
        let from = if self.eat_keyword("from") {
            Some(self.from_term()?)
        } else {
            None
        };
        let let_ = if self.eat_keyword("let") {
            self.assignments()?
        } else {
            Vec::new()
        };
        let where_ = if self.eat_keyword("where") {
            Some(self.expr()?)
        } else {
            None
        };
        let mut group = GroupBy::default();
        let mut grouped = false;
        if self.eat_keyword("group") {
            self.expect_keyword("by")?;
            grouped = true;
            loop {
                group.by.push(self.expr()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        if self.eat_keyword("letting") {
            grouped = true;
            group.letting = self.assignments()?;
        }
        if self.eat_keyword("having") {
            grouped = true;
            group.having = Some(self.expr()?);
        }
        Ok(Subselect {
            from,
            let_,
            where_,
            group: grouped.then_some(group),
            projection: Projection {
                distinct,
                raw,
                terms,
            },
        })
    }

    fn result_term(&mut self) -> PResult<ResultTerm> {
        if self.eat_sym("*") {
            return Ok(ResultTerm::star());
        }
        let expr = self.expr()?;
        let mut term = if matches!(self.peek(), Token::Sym(".")) && matches!(self.peek_at(1), Token::Sym("*")) {
            self.pos += 2;
            ResultTerm::path_star(expr)
        } else {
            ResultTerm::new(expr, None)
        };
        if self.eat_keyword("as") {
            term.alias = Some(self.variable()?);
        }
        Ok(term)
    }

    fn assignments(&mut self) -> PResult<Vec<Binding>> {
        let mut out = Vec::new();
        loop {
            let variable = self.variable()?;
            self.expect_sym("=")?;
            let expr = self.expr()?;
            out.push(Binding::new(variable, expr));
            if !self.eat_sym(",") {
                return Ok(out);
            }
        }
    }

    fn keyspace_term(&mut self) -> PResult<KeyspaceTerm> {
        let first = self.variable()?;
        let mut term = if self.eat_sym(":") {
            KeyspaceTerm::new(self.variable()?).namespace(first)
        } else {
            KeyspaceTerm::new(first)
        };
        if self.eat_keyword("as") {
            term.alias = Some(self.variable()?);
        }
        if self.eat_keyword("use") {
            self.expect_keyword("keys")?;
            term.keys = Some(self.expr()?);
        }
        Ok(term)
    }

    fn from_primary(&mut self) -> PResult<FromTerm> {
        if matches!(self.peek(), Token::Sym("(")) && self.is_keyword_at(1, "select") {
            self.pos += 1;
            let select = self.select()?;
            self.expect_sym(")")?;
            self.expect_keyword("as")?;
            let alias = self.variable()?;
            return Ok(FromTerm::Subquery {
                select: Box::new(select),
                alias,
            });
        }
        if matches!(self.peek(), Token::Quoted(_)) {
            return Ok(FromTerm::Keyspace(self.keyspace_term()?));
        }
        let expr = self.expr()?;
        self.expect_keyword("as")?;
        let alias = self.variable()?;
        Ok(FromTerm::Expression { expr, alias })
    }

    fn from_term(&mut self) -> PResult<FromTerm> {
        let mut term = self.from_primary()?;
        loop {
            let save = self.pos;
            let outer = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                true
            } else {
                self.eat_keyword("inner");
                false
            };
            let nest = if self.eat_keyword("join") {
                false
            } else if self.eat_keyword("nest") {
                true
            } else if self.eat_keyword("unnest") {
                let expr = self.expr()?;
                self.expect_keyword("as")?;
                let alias = self.variable()?;
                term = FromTerm::Unnest(Box::new(UnnestTerm {
                    left: term,
                    expr,
                    alias,
                    outer,
                }));
                continue;
            } else {
                self.pos = save;
                return Ok(term);
            };
            let right = self.keyspace_term()?;
            self.expect_keyword("on")?;
            let condition = if self.eat_keyword("keys") {
                JoinCondition::OnKeys(self.expr()?)
            } else {
                JoinCondition::On {
                    expr: self.expr()?,
                    hint: JoinHint::None,
                }
            };
            let join = Box::new(JoinTerm {
                left: term,
                right,
                outer,
                condition,
            });
            term = if nest {
                FromTerm::Nest(join)
            } else {
                FromTerm::Join(join)
            };
        }
    }
}

fn fold_array(items: Vec<Expr>) -> Expr {
    if items.iter().all(|item| matches!(item, Expr::Constant(_))) {
        let values = items
            .into_iter()
            .filter_map(|item| match item {
                Expr::Constant(value) => Some(value),
                _ => None,
            })
            .collect();
        return Expr::Constant(Value::Array(values));
    }
    Expr::ArrayConstruct(items)
}

fn negate(n: &Number) -> Option<Number> {
    if let Some(i) = n.as_i64() {
        return i.checked_neg().map(Number::from);
    }
    n.as_f64().and_then(|f| Number::from_f64(-f))
}
