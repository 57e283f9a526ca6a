// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and PCQ Contributors
// SPDX-License-Identifier: Apache-2.0

use super::compiler::CompileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Int(u64),
    /// Seconds plus the normalized spelling (`30d`).
    Duration(u64, String),
    Semi,
    Colon,
    Comma,
    Dot,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    EqEq,
    NotEq,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("`{s}`"),
            TokenKind::Str(s) => format!("string {s:?}"),
            TokenKind::Int(n) => format!("integer {n}"),
            TokenKind::Duration(_, raw) => format!("duration {raw}"),
            other => format!("`{}`", other.normalized()),
        }
    }

    /// Spelling used for the source hash. Whitespace, comments and redundant
    /// leading zeros never reach it.
    pub fn normalized(&self) -> String {
        match self {
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Str(s) => serde_json::Value::String(s.clone()).to_string(),
            TokenKind::Int(n) => n.to_string(),
            TokenKind::Duration(_, raw) => raw.clone(),
            TokenKind::Semi => ";".to_string(),
            TokenKind::Colon => ":".to_string(),
            TokenKind::Comma => ",".to_string(),
            TokenKind::Dot => ".".to_string(),
            TokenKind::LBrace => "{".to_string(),
            TokenKind::RBrace => "}".to_string(),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::EqEq => "==".to_string(),
            TokenKind::NotEq => "!=".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
}

impl Cursor<'_> {
    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }
}

fn grammar(line: u32, col: u32, message: impl Into<String>) -> CompileError {
    CompileError::GrammarError {
        line,
        col,
        message: message.into(),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut cur = Cursor {
        chars: source.chars().peekable(),
        line: 1,
        col: 1,
    };
    let mut out = Vec::new();
    while let Some(c) = cur.peek() {
        let (line, col) = (cur.line, cur.col);
        if c.is_whitespace() {
            cur.bump();
            continue;
        }
        if c == '#' {
            cur.skip_line();
            continue;
        }
        if c == '/' {
            cur.bump();
            if cur.peek() == Some('/') {
                cur.skip_line();
                continue;
            }
            return Err(grammar(line, col, "unexpected `/`"));
        }
        let kind = match c {
            ';' | ':' | ',' | '.' | '{' | '}' | '[' | ']' => {
                cur.bump();
                match c {
                    ';' => TokenKind::Semi,
                    ':' => TokenKind::Colon,
                    ',' => TokenKind::Comma,
                    '.' => TokenKind::Dot,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::RBracket,
                }
            }
            '=' | '!' => {
                cur.bump();
                if cur.peek() != Some('=') {
                    return Err(grammar(line, col, format!("expected `{c}=`")));
                }
                cur.bump();
                if c == '=' {
                    TokenKind::EqEq
                } else {
                    TokenKind::NotEq
                }
            }
            '"' => {
                cur.bump();
                let mut s = String::new();
                loop {
                    match cur.bump() {
                        None | Some('\n') => {
                            return Err(grammar(line, col, "unterminated string"))
                        }
                        Some('"') => break,
                        Some('\\') => match cur.bump() {
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            _ => return Err(grammar(cur.line, cur.col, "invalid escape")),
                        },
                        Some(other) => s.push(other),
                    }
                }
                TokenKind::Str(s)
            }
            d if d.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = cur.peek().filter(char::is_ascii_digit) {
                    digits.push(d);
                    cur.bump();
                }
                let n: u64 = digits
                    .parse()
                    .map_err(|_| grammar(line, col, "integer out of range"))?;
                match cur.peek() {
                    Some(unit @ ('s' | 'm' | 'h' | 'd')) => {
                        cur.bump();
                        if cur.peek().is_some_and(is_ident_continue) {
                            return Err(grammar(line, col, "malformed duration"));
                        }
                        let raw = format!("{n}{unit}");
                        let secs = super::parse_duration_secs(&raw)
                            .ok_or_else(|| grammar(line, col, "duration out of range"))?;
                        TokenKind::Duration(secs, raw)
                    }
                    Some(other) if is_ident_continue(other) => {
                        return Err(grammar(line, col, "malformed number"))
                    }
                    _ => TokenKind::Int(n),
                }
            }
            c if is_ident_start(c) => {
                let mut s = String::new();
                while let Some(c) = cur.peek().filter(|c| is_ident_continue(*c)) {
                    s.push(c);
                    cur.bump();
                }
                TokenKind::Ident(s)
            }
            other => return Err(grammar(line, col, format!("unexpected character {other:?}"))),
        };
        out.push(Token { kind, line, col });
    }
    Ok(out)
}

pub fn normalize(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.kind.normalized())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_clause_with_condition() {
        let got = kinds(r#"grant g1 { allow: read; where: subject.role == "analyst"; }"#);
        assert_eq!(got[0], TokenKind::Ident("grant".into()));
        assert_eq!(got[1], TokenKind::Ident("g1".into()));
        assert!(got.contains(&TokenKind::EqEq));
        assert!(got.contains(&TokenKind::Str("analyst".into())));
        assert_eq!(got.last(), Some(&TokenKind::RBrace));
    }

    #[test]
    fn durations_and_ints_are_distinct() {
        assert_eq!(
            kinds("30d 007 90"),
            vec![
                TokenKind::Duration(30 * 86_400, "30d".into()),
                TokenKind::Int(7),
                TokenKind::Int(90)
            ]
        );
    }

    #[test]
    fn comments_and_whitespace_do_not_change_normal_form() {
        let a = tokenize("lac v1;\n# comment\npolicy \"p\"  tenant \"t\" version 1;").unwrap();
        let b = tokenize("lac v1; // other\npolicy \"p\" tenant \"t\" version 01 ;").unwrap();
        assert_eq!(normalize(&a), normalize(&b));
    }

    #[test]
    fn reports_position_of_bad_character() {
        let err = tokenize("lac v1;\n  @").unwrap_err();
        assert_eq!(
            err,
            CompileError::GrammarError {
                line: 2,
                col: 3,
                message: "unexpected character '@'".into()
            }
        );
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(matches!(
            tokenize("policy \"abc"),
            Err(CompileError::GrammarError { line: 1, col: 8, .. })
        ));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert!(tokenize("12x").is_err());
        assert!(tokenize("30days").is_err());
    }
}
