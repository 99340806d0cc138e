//! Tokenizer for the `${{ }}` expression language.
//!
//! A single left-to-right scan. Two-character operators are matched before
//! their one-character prefixes so `<=` never lexes as `<` followed by `=`.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(serde_json::Number),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    /// Short rendering used in syntax error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Number(n) => format!("number {n}"),
            Token::True => "'true'".to_string(),
            Token::False => "'false'".to_string(),
            Token::Null => "'null'".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Comma => "','".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Question => "'?'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::Eq => "'=='".to_string(),
            Token::Ne => "'!='".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Le => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Ge => "'>='".to_string(),
        }
    }
}

/// A token with the character offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let next = chars.get(i + 1).copied();

        let two = match (ch, next) {
            ('&', Some('&')) => Some(Token::And),
            ('|', Some('|')) => Some(Token::Or),
            ('=', Some('=')) => Some(Token::Eq),
            ('!', Some('=')) => Some(Token::Ne),
            ('<', Some('=')) => Some(Token::Le),
            ('>', Some('=')) => Some(Token::Ge),
            _ => None,
        };
        if let Some(token) = two {
            tokens.push(Spanned { token, pos: start });
            i += 2;
            continue;
        }

        let one = match ch {
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '?' => Some(Token::Question),
            ':' => Some(Token::Colon),
            '!' => Some(Token::Not),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            _ => None,
        };
        if let Some(token) = one {
            tokens.push(Spanned { token, pos: start });
            i += 1;
            continue;
        }

        if ch == '\'' || ch == '"' {
            let (value, end) = lex_string(&chars, i)?;
            tokens.push(Spanned {
                token: Token::Str(value),
                pos: start,
            });
            i = end;
            continue;
        }

        let negative_number = ch == '-' && next.is_some_and(|c| c.is_ascii_digit());
        if ch.is_ascii_digit() || negative_number {
            let (number, end) = lex_number(&chars, i)?;
            tokens.push(Spanned {
                token: Token::Number(number),
                pos: start,
            });
            i = end;
            continue;
        }

        if is_ident_start(ch) {
            let mut end = i;
            while end < chars.len() && is_ident_char(chars[end]) {
                end += 1;
            }
            let word: String = chars[i..end].iter().collect();
            let token = match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, pos: start });
            i = end;
            continue;
        }

        return Err(ExpressionError::Syntax {
            position: start,
            message: format!("unexpected character '{ch}'"),
        });
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ExpressionError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((value, i + 1));
        }
        if c == '\\' {
            let Some(escaped) = chars.get(i + 1) else {
                break;
            };
            value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => *other,
            });
            i += 2;
            continue;
        }
        value.push(c);
        i += 1;
    }

    Err(ExpressionError::Syntax {
        position: start,
        message: "unterminated string literal".to_string(),
    })
}

fn lex_number(chars: &[char], start: usize) -> Result<(serde_json::Number, usize), ExpressionError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_float = false;
    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }

    let text: String = chars[start..i].iter().collect();
    let invalid = || ExpressionError::Syntax {
        position: start,
        message: format!("invalid number '{text}'"),
    };

    let number = if is_float {
        let value: f64 = text.parse().map_err(|_| invalid())?;
        serde_json::Number::from_f64(value).ok_or_else(invalid)?
    } else {
        let value: i64 = text.parse().map_err(|_| invalid())?;
        serde_json::Number::from(value)
    };
    Ok((number, i))
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

/// Stage ids such as `fetch-data` are addressed directly, so `-` is legal
/// inside identifiers. The grammar has no subtraction.
fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_two_char_operators_win() {
        assert_eq!(
            kinds("a <= b >= c == d != e && f || g"),
            vec![
                Token::Ident("a".into()),
                Token::Le,
                Token::Ident("b".into()),
                Token::Ge,
                Token::Ident("c".into()),
                Token::Eq,
                Token::Ident("d".into()),
                Token::Ne,
                Token::Ident("e".into()),
                Token::And,
                Token::Ident("f".into()),
                Token::Or,
                Token::Ident("g".into()),
            ]
        );
    }

    #[test]
    fn test_single_char_operators() {
        assert_eq!(kinds("!a"), vec![Token::Not, Token::Ident("a".into())]);
        assert_eq!(
            kinds("a < b"),
            vec![Token::Ident("a".into()), Token::Lt, Token::Ident("b".into())]
        );
    }

    #[test]
    fn test_dotted_path_with_hyphen() {
        assert_eq!(
            kinds("stages.fetch-data.outputs"),
            vec![
                Token::Ident("stages".into()),
                Token::Dot,
                Token::Ident("fetch-data".into()),
                Token::Dot,
                Token::Ident("outputs".into()),
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds("'it\\'s' \"x\" 42 -3 1.5 true false null"),
            vec![
                Token::Str("it's".into()),
                Token::Str("x".into()),
                Token::Number(42.into()),
                Token::Number((-3).into()),
                Token::Number(serde_json::Number::from_f64(1.5).unwrap()),
                Token::True,
                Token::False,
                Token::Null,
            ]
        );
    }

    #[test]
    fn test_positions_recorded() {
        let tokens = tokenize("a  == 'b'").unwrap();
        assert_eq!(tokens[0].pos, 0);
        assert_eq!(tokens[1].pos, 3);
        assert_eq!(tokens[2].pos, 6);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("'abc").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { position: 0, .. }));
    }

    #[test]
    fn test_lone_ampersand_rejected() {
        let err = tokenize("a & b").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { position: 2, .. }));
        assert!(tokenize("a = b").is_err());
    }
}
