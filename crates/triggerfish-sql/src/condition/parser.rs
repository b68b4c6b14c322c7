//! Parser for predicate source text.
//!
//! Accepts a closed, JavaScript-flavoured arrow-function grammar:
//!
//! ```text
//! predicate  := header? body ';'?
//! header     := '(' [ident (',' ident)?] ')' '=>' | ident '=>'
//!             | 'function' ident? '(' [ident (',' ident)?] ')'
//! body       := '{' 'return' or ';'? '}' | or
//! or         := and ('||' and)*
//! and        := unary ('&&' unary)*
//! unary      := '!' unary | comparison
//! comparison := primary (cmp primary)?
//! primary    := '(' or ')' | field method? | literal
//! field      := row '.' ident | row '[' string ']'
//! method     := '.' ('includes' | 'startsWith' | 'endsWith') '(' string ')'
//! literal    := string | '-'? number | 'true' | 'false' | 'null' | 'undefined'
//! ```
//!
//! The first parameter names the after-image and the second the before-image;
//! without a header they are `NEW` and `OLD`. String literals are tokenized
//! up front, so their contents are never mistaken for operators.

use super::{CompareOp, Condition, FieldRef, Literal, Operand, PatternKind, RowRef};
use crate::error::{Error, Result};
use std::fmt;

/// Parse predicate source into a [`Condition`].
///
/// ```
/// use triggerfish_sql::condition::{new_field, old_field, parse_predicate};
///
/// let cond = parse_predicate("(NEW, OLD) => NEW.status !== OLD.status").unwrap();
/// assert_eq!(cond, new_field("status").ne(old_field("status")));
///
/// assert!(parse_predicate("(NEW) => NEW.name.toLowerCase() === 'x'").is_err());
/// ```
pub fn parse_predicate(source: &str) -> Result<Condition> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        new_name: "NEW".to_string(),
        old_name: Some("OLD".to_string()),
    };
    parser.predicate()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Semicolon,
    Arrow,
    AndAnd,
    OrOr,
    Bang,
    Minus,
    Cmp(CompareOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "'{}'", s),
            Self::Str(s) => write!(f, "string {:?}", s),
            Self::Num(n) => write!(f, "number {}", n),
            Self::LParen => write!(f, "'('"),
            Self::RParen => write!(f, "')'"),
            Self::LBracket => write!(f, "'['"),
            Self::RBracket => write!(f, "']'"),
            Self::LBrace => write!(f, "'{{'"),
            Self::RBrace => write!(f, "'}}'"),
            Self::Dot => write!(f, "'.'"),
            Self::Comma => write!(f, "','"),
            Self::Semicolon => write!(f, "';'"),
            Self::Arrow => write!(f, "'=>'"),
            Self::AndAnd => write!(f, "'&&'"),
            Self::OrOr => write!(f, "'||'"),
            Self::Bang => write!(f, "'!'"),
            Self::Minus => write!(f, "'-'"),
            Self::Cmp(op) => write!(f, "'{}'", op.sql()),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();

        match c {
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let (text, end) = string_literal(&chars, i)?;
                tokens.push(Token::Str(text));
                i = end;
            }
            '`' => return Err(Error::unsupported("template literals")),
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    return Err(Error::unsupported(format!(
                        "malformed number near '{}'",
                        chars[start..=i].iter().collect::<String>()
                    )));
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '(' => push(&mut tokens, &mut i, Token::LParen, 1),
            ')' => push(&mut tokens, &mut i, Token::RParen, 1),
            '[' => push(&mut tokens, &mut i, Token::LBracket, 1),
            ']' => push(&mut tokens, &mut i, Token::RBracket, 1),
            '{' => push(&mut tokens, &mut i, Token::LBrace, 1),
            '}' => push(&mut tokens, &mut i, Token::RBrace, 1),
            '.' => push(&mut tokens, &mut i, Token::Dot, 1),
            ',' => push(&mut tokens, &mut i, Token::Comma, 1),
            ';' => push(&mut tokens, &mut i, Token::Semicolon, 1),
            '-' => push(&mut tokens, &mut i, Token::Minus, 1),
            '=' => match (next, next2) {
                (Some('>'), _) => push(&mut tokens, &mut i, Token::Arrow, 2),
                (Some('='), Some('=')) => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Eq), 3),
                (Some('='), _) => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Eq), 2),
                _ => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Eq), 1),
            },
            '!' => match (next, next2) {
                (Some('='), Some('=')) => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Ne), 3),
                (Some('='), _) => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Ne), 2),
                _ => push(&mut tokens, &mut i, Token::Bang, 1),
            },
            '<' => match next {
                Some('=') => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Le), 2),
                Some('<') => return Err(Error::unsupported("operator '<<'")),
                _ => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Lt), 1),
            },
            '>' => match next {
                Some('=') => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Ge), 2),
                Some('>') => return Err(Error::unsupported("operator '>>'")),
                _ => push(&mut tokens, &mut i, Token::Cmp(CompareOp::Gt), 1),
            },
            '&' if next == Some('&') => push(&mut tokens, &mut i, Token::AndAnd, 2),
            '|' if next == Some('|') => push(&mut tokens, &mut i, Token::OrOr, 2),
            other => {
                return Err(Error::unsupported(format!(
                    "unexpected character '{}'",
                    other.escape_default()
                )));
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, token: Token, width: usize) {
    tokens.push(token);
    *i += width;
}

fn string_literal(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| Error::unsupported("unterminated string literal"))?;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '\\' | '\'' | '"' => out.push(*escaped),
                    other => {
                        return Err(Error::unsupported(format!(
                            "string escape '\\{}'",
                            other
                        )));
                    }
                }
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Err(Error::unsupported("unterminated string literal"))
}

/// Intermediate result: a boolean condition or a bare value
enum Expr {
    Cond(Condition),
    Value(Operand),
}

impl Expr {
    fn into_condition(self) -> Result<Condition> {
        match self {
            Self::Cond(c) => Ok(c),
            Self::Value(Operand::Field(f)) => Ok(Condition::IsTrue(f)),
            Self::Value(Operand::Literal(l)) => Err(Error::unsupported(format!(
                "constant {} is not a condition on NEW or OLD",
                l.type_name()
            ))),
        }
    }

    fn into_operand(self) -> Result<Operand> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Cond(_) => Err(Error::unsupported(
                "comparison operand must be a field or a literal",
            )),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    new_name: String,
    old_name: Option<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.bump() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(Error::unsupported(format!(
                "expected {} but found {}",
                expected, t
            ))),
            None => Err(Error::unsupported(format!(
                "expected {} but the expression ended",
                expected
            ))),
        }
    }

    fn predicate(&mut self) -> Result<Condition> {
        if self.tokens.is_empty() {
            return Err(Error::unsupported("empty predicate"));
        }

        let had_header = self.header()?;
        let cond = if had_header && self.eat(&Token::LBrace) {
            match self.bump() {
                Some(Token::Ident(kw)) if kw == "return" => {}
                Some(t) => {
                    return Err(Error::unsupported(format!(
                        "function body must be a single return statement, found {}",
                        t
                    )));
                }
                None => return Err(Error::unsupported("empty function body")),
            }
            let cond = self.or()?.into_condition()?;
            self.eat(&Token::Semicolon);
            self.expect(Token::RBrace)?;
            cond
        } else {
            self.or()?.into_condition()?
        };

        self.eat(&Token::Semicolon);
        if let Some(t) = self.peek() {
            return Err(Error::unsupported(format!("unexpected trailing {}", t)));
        }
        Ok(cond)
    }

    /// Consume a parameter header if present and bind row names
    fn header(&mut self) -> Result<bool> {
        if let Some(Token::Ident(kw)) = self.peek() {
            if kw == "function" {
                self.pos += 1;
                if let Some(Token::Ident(_)) = self.peek() {
                    self.pos += 1;
                }
                self.expect(Token::LParen)?;
                let params = self.param_list()?;
                self.bind(params)?;
                return Ok(true);
            }
            if kw == "async" {
                return Err(Error::unsupported("async predicates"));
            }
            if self.peek_at(1) == Some(&Token::Arrow) {
                let name = kw.clone();
                self.pos += 2;
                self.bind(vec![name])?;
                return Ok(true);
            }
            return Ok(false);
        }

        if self.peek() != Some(&Token::LParen) {
            return Ok(false);
        }

        // Look ahead for `( ident, ident ) =>` without committing.
        let mut offset = 1;
        loop {
            match self.peek_at(offset) {
                Some(Token::Ident(_)) | Some(Token::Comma) => offset += 1,
                Some(Token::RParen) => break,
                _ => return Ok(false),
            }
        }
        if self.peek_at(offset + 1) != Some(&Token::Arrow) {
            return Ok(false);
        }

        self.pos += 1;
        let params = self.param_list()?;
        self.expect(Token::Arrow)?;
        self.bind(params)?;
        Ok(true)
    }

    /// Parameters up to and including the closing parenthesis
    fn param_list(&mut self) -> Result<Vec<String>> {
        let mut params = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(params);
        }
        loop {
            match self.bump() {
                Some(Token::Ident(name)) => params.push(name),
                Some(t) => {
                    return Err(Error::unsupported(format!(
                        "unsupported parameter {}",
                        t
                    )))
                }
                None => return Err(Error::unsupported("unterminated parameter list")),
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(params),
                Some(t) => {
                    return Err(Error::unsupported(format!(
                        "expected ',' or ')' but found {}",
                        t
                    )))
                }
                None => return Err(Error::unsupported("unterminated parameter list")),
            }
        }
    }

    fn bind(&mut self, params: Vec<String>) -> Result<()> {
        if params.len() > 2 {
            return Err(Error::unsupported(format!(
                "predicate takes at most two records (NEW, OLD), got '{}'",
                params[2]
            )));
        }
        let mut params = params.into_iter();
        // An empty header leaves no names bound; any field read then fails.
        self.new_name = params.next().unwrap_or_default();
        self.old_name = params.next();
        if self.old_name.as_deref() == Some(self.new_name.as_str()) {
            return Err(Error::unsupported("duplicate parameter names"));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr> {
        let first = self.and()?;
        if self.peek() != Some(&Token::OrOr) {
            return Ok(first);
        }
        let mut items = vec![first.into_condition()?];
        while self.eat(&Token::OrOr) {
            items.push(self.and()?.into_condition()?);
        }
        Ok(Expr::Cond(Condition::Or(items)))
    }

    fn and(&mut self) -> Result<Expr> {
        let first = self.unary()?;
        if self.peek() != Some(&Token::AndAnd) {
            return Ok(first);
        }
        let mut items = vec![first.into_condition()?];
        while self.eat(&Token::AndAnd) {
            items.push(self.unary()?.into_condition()?);
        }
        Ok(Expr::Cond(Condition::And(items)))
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            // `!` binds tighter than comparisons: `!NEW.a === 1` compares a negated value
            let inner = if self.peek() == Some(&Token::Bang) {
                self.unary()?
            } else {
                self.primary()?
            };
            if let Some(t @ Token::Cmp(_)) = self.peek() {
                return Err(Error::unsupported(format!(
                    "comparison {} applied to a negated value",
                    t
                )));
            }
            return Ok(Expr::Cond(Condition::Not(Box::new(inner.into_condition()?))));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        let Some(Token::Cmp(op)) = self.peek().cloned() else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.primary()?;
        Ok(Expr::Cond(Condition::Compare {
            left: left.into_operand()?,
            op,
            right: right.into_operand()?,
        }))
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Value(Operand::Literal(Literal::String(s)))),
            Some(Token::Num(n)) => Ok(Expr::Value(Operand::Literal(number(&n, false)?))),
            Some(Token::Minus) => match self.bump() {
                Some(Token::Num(n)) => Ok(Expr::Value(Operand::Literal(number(&n, true)?))),
                Some(t) => Err(Error::unsupported(format!("unary '-' applied to {}", t))),
                None => Err(Error::unsupported("dangling '-'")),
            },
            Some(Token::Ident(name)) => self.identifier(name),
            Some(t) => Err(Error::unsupported(format!("unexpected {}", t))),
            None => Err(Error::unsupported("expression ended unexpectedly")),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "true" => return Ok(Expr::Value(Operand::Literal(Literal::Bool(true)))),
            "false" => return Ok(Expr::Value(Operand::Literal(Literal::Bool(false)))),
            "null" | "undefined" => return Ok(Expr::Value(Operand::Literal(Literal::Null))),
            _ => {}
        }

        let row = if !self.new_name.is_empty() && name == self.new_name {
            RowRef::New
        } else if self.old_name.as_deref() == Some(name.as_str()) {
            RowRef::Old
        } else {
            return Err(Error::unsupported(format!(
                "reference to '{}', only the NEW and OLD records are available",
                name
            )));
        };

        let column = match self.bump() {
            Some(Token::Dot) => match self.bump() {
                Some(Token::Ident(column)) => column,
                Some(t) => return Err(Error::unsupported(format!("unexpected {} after '.'", t))),
                None => return Err(Error::unsupported("expression ended after '.'")),
            },
            Some(Token::LBracket) => {
                let column = match self.bump() {
                    Some(Token::Str(column)) => column,
                    Some(t) => {
                        return Err(Error::unsupported(format!(
                            "computed member access with {}",
                            t
                        )))
                    }
                    None => return Err(Error::unsupported("expression ended after '['")),
                };
                self.expect(Token::RBracket)?;
                column
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "record '{}' must be accessed through a field",
                    name
                )))
            }
        };
        let field = FieldRef { row, column };

        if self.peek() == Some(&Token::Dot) || self.peek() == Some(&Token::LBracket) {
            return self.method(field);
        }
        Ok(Expr::Value(Operand::Field(field)))
    }

    fn method(&mut self, field: FieldRef) -> Result<Expr> {
        if self.eat(&Token::LBracket) {
            return Err(Error::unsupported(format!(
                "nested access on {}.{}",
                field.row, field.column
            )));
        }
        self.expect(Token::Dot)?;
        let name = match self.bump() {
            Some(Token::Ident(name)) => name,
            Some(t) => return Err(Error::unsupported(format!("unexpected {} after '.'", t))),
            None => return Err(Error::unsupported("expression ended after '.'")),
        };
        let kind = match name.as_str() {
            "includes" => PatternKind::Contains,
            "startsWith" => PatternKind::StartsWith,
            "endsWith" => PatternKind::EndsWith,
            _ if self.peek() == Some(&Token::LParen) => {
                return Err(Error::unsupported(format!("method call '{}'", name)));
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "nested access '{}.{}.{}'",
                    field.row, field.column, name
                )));
            }
        };
        self.expect(Token::LParen)?;
        let pattern = match self.bump() {
            Some(Token::Str(s)) => s,
            Some(t) => {
                return Err(Error::unsupported(format!(
                    "'{}' argument must be a string literal, found {}",
                    name, t
                )))
            }
            None => return Err(Error::unsupported("expression ended inside a call")),
        };
        self.expect(Token::RParen)?;
        Ok(Expr::Cond(Condition::Pattern {
            field,
            kind,
            pattern: Operand::Literal(Literal::String(pattern)),
        }))
    }
}

fn number(text: &str, negative: bool) -> Result<Literal> {
    let signed = if negative {
        format!("-{}", text)
    } else {
        text.to_string()
    };
    if !text.contains('.') {
        return signed
            .parse::<i64>()
            .map(Literal::Int)
            .map_err(|_| Error::unsupported(format!("integer {} out of range", signed)));
    }
    match signed.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(Literal::Float(n)),
        _ => Err(Error::unsupported(format!("number {} out of range", signed))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keeps_operators_inside_strings() {
        let tokens = tokenize("NEW.note === 'a && b || !c'").unwrap();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[4], Token::Str("a && b || !c".into()));
    }

    #[test]
    fn test_tokenize_escapes() {
        let tokens = tokenize(r#"'it\'s' "say \"hi\"""#).unwrap();
        assert_eq!(
            tokens,
            vec![Token::Str("it's".into()), Token::Str("say \"hi\"".into())]
        );
    }

    #[test]
    fn test_number_forms() {
        assert_eq!(number("42", false).unwrap(), Literal::Int(42));
        assert_eq!(number("42", true).unwrap(), Literal::Int(-42));
        assert_eq!(number("1.5", false).unwrap(), Literal::Float(1.5));
        assert_eq!(
            number("9223372036854775808", true).unwrap(),
            Literal::Int(i64::MIN)
        );
        assert!(number("9223372036854775808", false)
            .unwrap_err()
            .to_string()
            .contains("out of range"));
        assert!(number("99999999999999999999", false).is_err());
    }

    #[test]
    fn test_malformed_number() {
        assert!(tokenize("NEW.a > 12abc").is_err());
    }
}
