//! Tokenizer for filter and payload expressions.

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Number,
    String,
    True,
    False,
    Null,
    In,
    Plus,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedCharacter { ch: char, pos: usize },
    #[error("unterminated string at {pos}")]
    UnterminatedString { pos: usize },
    #[error("invalid escape sequence at {pos}")]
    InvalidEscape { pos: usize },
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = input.chars().collect();
    let mut index = 0usize;
    let mut tokens = Vec::new();

    while index < chars.len() {
        let ch = chars[index];
        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            tokens.push(consume_identifier(&chars, &mut index));
            continue;
        }

        if ch.is_ascii_digit() {
            tokens.push(consume_number(&chars, &mut index));
            continue;
        }

        if ch == '\'' || ch == '"' {
            tokens.push(consume_string(&chars, &mut index)?);
            continue;
        }

        tokens.push(consume_symbol(&chars, &mut index)?);
    }

    tokens.push(Token { kind: TokenKind::Eof, lexeme: String::new(), pos: chars.len() });
    Ok(tokens)
}

fn consume_identifier(chars: &[char], index: &mut usize) -> Token {
    let start = *index;
    while *index < chars.len() && (chars[*index].is_ascii_alphanumeric() || chars[*index] == '_') {
        *index += 1;
    }
    let lexeme: String = chars[start..*index].iter().collect();
    let kind = match lexeme.as_str() {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" | "nil" => TokenKind::Null,
        "in" => TokenKind::In,
        "and" => TokenKind::AndAnd,
        "or" => TokenKind::OrOr,
        "not" => TokenKind::Bang,
        _ => TokenKind::Identifier,
    };
    Token { kind, lexeme, pos: start }
}

fn consume_number(chars: &[char], index: &mut usize) -> Token {
    let start = *index;
    while *index < chars.len() && chars[*index].is_ascii_digit() {
        *index += 1;
    }
    if *index + 1 < chars.len() && chars[*index] == '.' && chars[*index + 1].is_ascii_digit() {
        *index += 1;
        while *index < chars.len() && chars[*index].is_ascii_digit() {
            *index += 1;
        }
    }
    Token {
        kind: TokenKind::Number,
        lexeme: chars[start..*index].iter().collect(),
        pos: start,
    }
}

fn consume_string(chars: &[char], index: &mut usize) -> Result<Token, LexError> {
    let start = *index;
    let quote = chars[start];
    *index += 1;
    let mut value = String::new();

    while *index < chars.len() {
        let ch = chars[*index];
        if ch == quote {
            *index += 1;
            return Ok(Token { kind: TokenKind::String, lexeme: value, pos: start });
        }
        if ch == '\\' {
            let escaped = chars.get(*index + 1).ok_or(LexError::UnterminatedString { pos: start })?;
            value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                _ => return Err(LexError::InvalidEscape { pos: *index }),
            });
            *index += 2;
            continue;
        }
        value.push(ch);
        *index += 1;
    }

    Err(LexError::UnterminatedString { pos: start })
}

fn consume_symbol(chars: &[char], index: &mut usize) -> Result<Token, LexError> {
    let pos = *index;
    let ch = chars[pos];
    let next = chars.get(pos + 1).copied();

    let (kind, width) = match (ch, next) {
        ('=', Some('=')) => (TokenKind::EqEq, 2),
        ('!', Some('=')) => (TokenKind::NotEq, 2),
        ('<', Some('=')) => (TokenKind::Le, 2),
        ('>', Some('=')) => (TokenKind::Ge, 2),
        ('&', Some('&')) => (TokenKind::AndAnd, 2),
        ('|', Some('|')) => (TokenKind::OrOr, 2),
        ('<', _) => (TokenKind::Lt, 1),
        ('>', _) => (TokenKind::Gt, 1),
        ('!', _) => (TokenKind::Bang, 1),
        ('+', _) => (TokenKind::Plus, 1),
        ('-', _) => (TokenKind::Minus, 1),
        ('(', _) => (TokenKind::LParen, 1),
        (')', _) => (TokenKind::RParen, 1),
        ('[', _) => (TokenKind::LBracket, 1),
        (']', _) => (TokenKind::RBracket, 1),
        (',', _) => (TokenKind::Comma, 1),
        ('.', _) => (TokenKind::Dot, 1),
        ('?', _) => (TokenKind::Question, 1),
        (':', _) => (TokenKind::Colon, 1),
        _ => return Err(LexError::UnexpectedCharacter { ch, pos }),
    };

    *index += width;
    Ok(Token { kind, lexeme: chars[pos..pos + width].iter().collect(), pos })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_with_word_operators() {
        let kinds: Vec<TokenKind> = tokenize("ref == 'v1' and not draft")
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::EqEq,
                TokenKind::String,
                TokenKind::AndAnd,
                TokenKind::Bang,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert_eq!(tokenize("ref == 'v1"), Err(LexError::UnterminatedString { pos: 7 }));
        assert!(matches!(tokenize("a = b"), Err(LexError::UnexpectedCharacter { ch: '=', .. })));
    }
}
