use crate::error::{DbError, DbResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Uint(u64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Assign,
    Eof,
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();
        Self {
            input: chars,
            position: 0,
            current_char,
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut s = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                s.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        s
    }

    /// Reads either a plain unsigned integer or a bare timestamp like
    /// `2016-01-02T03:04`, which lexes as an identifier-style token.
    fn read_number(&mut self) -> DbResult<Token> {
        let mut s = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                s.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if matches!(self.current_char, Some('-') | Some(':') | Some('T')) {
            while let Some(ch) = self.current_char {
                if ch.is_ascii_digit() || ch == '-' || ch == ':' || ch == 'T' {
                    s.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            return Ok(Token::Ident(s));
        }
        s.parse::<u64>()
            .map(Token::Uint)
            .map_err(|_| DbError::InvalidQuery(format!("bad number '{}'", s)))
    }

    fn read_string(&mut self) -> DbResult<Token> {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.current_char {
                Some('"') => {
                    self.advance();
                    return Ok(Token::Str(s));
                }
                Some('\\') => {
                    self.advance();
                    match self.current_char {
                        Some(ch) => {
                            s.push(ch);
                            self.advance();
                        }
                        None => {
                            return Err(DbError::InvalidQuery("unterminated string".to_string()))
                        }
                    }
                }
                Some(ch) => {
                    s.push(ch);
                    self.advance();
                }
                None => return Err(DbError::InvalidQuery("unterminated string".to_string())),
            }
        }
    }

    pub fn next_token(&mut self) -> DbResult<Token> {
        self.skip_whitespace();
        let Some(ch) = self.current_char else {
            return Ok(Token::Eof);
        };
        match ch {
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            '[' => {
                self.advance();
                Ok(Token::LBracket)
            }
            ']' => {
                self.advance();
                Ok(Token::RBracket)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            '=' => {
                self.advance();
                Ok(Token::Assign)
            }
            '"' => self.read_string(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_ascii_alphabetic() || c == '_' => Ok(Token::Ident(self.read_identifier())),
            c => Err(DbError::InvalidQuery(format!("unexpected character '{}'", c))),
        }
    }

    pub fn tokenize(mut self) -> DbResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_call() {
        let tokens = Lexer::new(r#"row(id=10, field="f")"#).tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("row".to_string()),
                Token::LParen,
                Token::Ident("id".to_string()),
                Token::Assign,
                Token::Uint(10),
                Token::Comma,
                Token::Ident("field".to_string()),
                Token::Assign,
                Token::Str("f".to_string()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_bare_timestamp_lexes_as_ident() {
        let tokens = Lexer::new("at=2016-01-02T03:04").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("at".to_string()),
                Token::Assign,
                Token::Ident("2016-01-02T03:04".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(Lexer::new(r#"row(field="f"#).tokenize().is_err());
    }

    #[test]
    fn test_unexpected_character() {
        assert!(Lexer::new("row(id=10) & count()").tokenize().is_err());
    }
}
