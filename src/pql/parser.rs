use super::ast::{ArgValue, Call, Query};
use super::lexer::{Lexer, Token};
use crate::error::{DbError, DbResult};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(input: &str) -> DbResult<Parser> {
        Ok(Parser {
            tokens: Lexer::new(input).tokenize()?,
            pos: 0,
        })
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.current().clone();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> DbResult<()> {
        let got = self.advance();
        if got == want {
            Ok(())
        } else {
            Err(DbError::InvalidQuery(format!(
                "expected {:?}, found {:?}",
                want, got
            )))
        }
    }

    pub fn parse(mut self) -> DbResult<Query> {
        let mut calls = Vec::new();
        while *self.current() != Token::Eof {
            calls.push(self.parse_call()?);
        }
        if calls.is_empty() {
            return Err(DbError::InvalidQuery("empty query".to_string()));
        }
        Ok(Query { calls })
    }

    fn parse_call(&mut self) -> DbResult<Call> {
        let name = match self.advance() {
            Token::Ident(name) => name,
            t => {
                return Err(DbError::InvalidQuery(format!(
                    "expected call name, found {:?}",
                    t
                )))
            }
        };
        self.expect(Token::LParen)?;

        let mut call = Call::new(&name);
        loop {
            match self.current() {
                Token::RParen => {
                    self.advance();
                    return Ok(call);
                }
                Token::Comma => {
                    self.advance();
                }
                Token::Ident(_) if *self.peek() == Token::LParen => {
                    call.children.push(self.parse_call()?);
                }
                Token::Ident(_) if *self.peek() == Token::Assign => {
                    let key = match self.advance() {
                        Token::Ident(k) => k,
                        _ => unreachable!(),
                    };
                    self.advance(); // '='
                    let value = self.parse_value()?;
                    call.args.insert(key, value);
                }
                t => {
                    return Err(DbError::InvalidQuery(format!(
                        "unexpected token {:?} in {}()",
                        t, name
                    )))
                }
            }
        }
    }

    fn parse_value(&mut self) -> DbResult<ArgValue> {
        match self.advance() {
            Token::Uint(v) => Ok(ArgValue::Uint(v)),
            Token::Str(s) => Ok(ArgValue::Str(s)),
            Token::Ident(s) => match s.as_str() {
                "true" => Ok(ArgValue::Bool(true)),
                "false" => Ok(ArgValue::Bool(false)),
                // Bare identifiers and timestamps read as strings.
                _ => Ok(ArgValue::Str(s)),
            },
            Token::LBracket => self.parse_list(),
            t => Err(DbError::InvalidQuery(format!(
                "expected value, found {:?}",
                t
            ))),
        }
    }

    fn parse_list(&mut self) -> DbResult<ArgValue> {
        let mut uints: Vec<u64> = Vec::new();
        let mut strs: Vec<String> = Vec::new();
        loop {
            match self.advance() {
                Token::RBracket => break,
                Token::Comma => {}
                Token::Uint(v) if strs.is_empty() => uints.push(v),
                Token::Str(s) | Token::Ident(s) if uints.is_empty() => strs.push(s),
                t => {
                    return Err(DbError::InvalidQuery(format!(
                        "mixed or invalid list element {:?}",
                        t
                    )))
                }
            }
        }
        if !strs.is_empty() {
            Ok(ArgValue::StrList(strs))
        } else {
            Ok(ArgValue::UintList(uints))
        }
    }
}

/// Parse a PQL request into its ordered list of calls.
pub fn parse(input: &str) -> DbResult<Query> {
    Parser::new(input)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row_call() {
        let q = parse("row(id=10, field=f)").unwrap();
        assert_eq!(q.calls.len(), 1);
        let call = &q.calls[0];
        assert_eq!(call.name, "row");
        assert_eq!(call.arg_u64("id"), Some(10));
        assert_eq!(call.arg_str("field"), Some("f"));
    }

    #[test]
    fn test_parse_nested_calls() {
        let q = parse("difference(row(id=10), row(id=11))").unwrap();
        let call = &q.calls[0];
        assert_eq!(call.name, "difference");
        assert_eq!(call.children.len(), 2);
        assert_eq!(call.children[0].arg_u64("id"), Some(10));
        assert_eq!(call.children[1].arg_u64("id"), Some(11));
    }

    #[test]
    fn test_parse_top_n_with_filter_and_lists() {
        let q = parse(r#"topN(row(id=3), field=f, n=2, attrName=color, attrValues=["red", "blue"])"#)
            .unwrap();
        let call = &q.calls[0];
        assert_eq!(call.children.len(), 1);
        assert_eq!(call.arg_u64("n"), Some(2));
        assert_eq!(call.arg_str("attrName"), Some("color"));
        assert_eq!(
            call.arg_str_list("attrValues"),
            Some(&["red".to_string(), "blue".to_string()][..])
        );

        let q = parse("topN(field=f, ids=[1, 2, 3])").unwrap();
        assert_eq!(q.calls[0].arg_uint_list("ids"), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_parse_multiple_calls() {
        let q = parse("setBit(row=1, field=f, col=2) count(row(id=1, field=f))").unwrap();
        assert_eq!(q.calls.len(), 2);
        assert!(q.calls[0].is_write());
        assert!(!q.calls[1].is_write());
    }

    #[test]
    fn test_parse_timestamp_argument() {
        let q = parse("setBit(row=1, field=f, col=2, at=2016-01-02T03:04)").unwrap();
        assert_eq!(q.calls[0].arg_str("at"), Some("2016-01-02T03:04"));
    }

    #[test]
    fn test_display_round_trip() {
        let inputs = [
            r#"row(field="f", id=10)"#,
            r#"difference(row(id=10), row(id=11))"#,
            r#"topN(row(id=3), attrName="color", field="f", n=2)"#,
            r#"setBit(col=2, field="f", row=1)"#,
        ];
        for input in inputs {
            let q = parse(input).unwrap();
            assert_eq!(q.to_string(), input);
            // Reparsing the canonical form is stable.
            let q2 = parse(&q.to_string()).unwrap();
            assert_eq!(q, q2);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("row").is_err());
        assert!(parse("row(").is_err());
        assert!(parse("row(id=)").is_err());
        assert!(parse("(id=1)").is_err());
        assert!(parse("topN(ids=[1, \"a\"])").is_err());
    }
}
