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

//! Recursive-descent parser for `lac v1` sources.
//!
//! ```text
//! lac v1;
//! policy "<name>" tenant "<tenant>" version <n>;
//! <kind> <rule-id> { <field>: <value>; ... }
//! ```

use std::collections::BTreeSet;

use super::compiler::CompileError;
use super::lexer::{Token, TokenKind};
use super::{Action, ActionSet, RuleKind, Scope};

pub const GRAMMAR_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondOp {
    Eq(String),
    Ne(String),
    In(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub scope: Scope,
    pub key: String,
    pub op: CondOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseBody {
    License {
        license: String,
        allow: ActionSet,
        conditions: Vec<Condition>,
    },
    Warrant {
        authority: String,
        allow: ActionSet,
        expires: Option<u64>,
        conditions: Vec<Condition>,
    },
    Purpose {
        actions: ActionSet,
        require: Vec<String>,
    },
    Retention {
        actions: ActionSet,
        max_secs: u64,
    },
    Grant {
        allow: ActionSet,
        conditions: Vec<Condition>,
    },
    Deny {
        actions: ActionSet,
        conditions: Vec<Condition>,
    },
}

impl ClauseBody {
    pub fn kind(&self) -> RuleKind {
        match self {
            ClauseBody::License { .. } => RuleKind::License,
            ClauseBody::Warrant { .. } => RuleKind::Warrant,
            ClauseBody::Purpose { .. } => RuleKind::Purpose,
            ClauseBody::Retention { .. } => RuleKind::Retention,
            ClauseBody::Grant { .. } => RuleKind::Grant,
            ClauseBody::Deny { .. } => RuleKind::Deny,
        }
    }

    pub fn actions(&self) -> ActionSet {
        match self {
            ClauseBody::License { allow, .. }
            | ClauseBody::Warrant { allow, .. }
            | ClauseBody::Grant { allow, .. } => *allow,
            ClauseBody::Purpose { actions, .. }
            | ClauseBody::Retention { actions, .. }
            | ClauseBody::Deny { actions, .. } => *actions,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match self {
            ClauseBody::License { conditions, .. }
            | ClauseBody::Warrant { conditions, .. }
            | ClauseBody::Grant { conditions, .. }
            | ClauseBody::Deny { conditions, .. } => conditions,
            ClauseBody::Purpose { .. } | ClauseBody::Retention { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub id: String,
    pub body: ClauseBody,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySource {
    pub name: String,
    pub tenant: String,
    pub version: u64,
    pub clauses: Vec<Clause>,
}

fn allowed_fields(kind: RuleKind) -> &'static [&'static str] {
    match kind {
        RuleKind::License => &["license", "allow", "where"],
        RuleKind::Warrant => &["authority", "allow", "expires", "where"],
        RuleKind::Purpose => &["actions", "require"],
        RuleKind::Retention => &["actions", "max"],
        RuleKind::Grant => &["allow", "where"],
        RuleKind::Deny => &["actions", "where"],
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut row = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
        }
        prev = row;
    }
    prev[b.len()]
}

fn suggest_clause(word: &str) -> Option<String> {
    RuleKind::ALL
        .into_iter()
        .map(|k| (levenshtein(word, k.keyword()), k.keyword()))
        .filter(|(d, _)| *d <= 2)
        .min()
        .map(|(_, k)| k.to_string())
}

#[derive(Default)]
struct Fields {
    actions: Option<ActionSet>,
    license: Option<String>,
    authority: Option<String>,
    expires: Option<u64>,
    require: Option<Vec<String>>,
    max_secs: Option<u64>,
    conditions: Option<Vec<Condition>>,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn here(&self) -> (u32, u32) {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|t| (t.line, t.col))
            .unwrap_or((1, 1))
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        let (line, col) = self.here();
        CompileError::GrammarError {
            line,
            col,
            message: message.into(),
        }
    }

    fn next(&mut self, what: &str) -> Result<&'a Token, CompileError> {
        let tok = self
            .peek()
            .ok_or_else(|| self.error(format!("expected {what}, found end of input")))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), CompileError> {
        let what = kind.describe();
        match self.peek() {
            Some(t) if t.kind == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(self.error(format!("expected {what}, found {}", t.kind.describe()))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self, what: &str) -> Result<&'a Token, CompileError> {
        match self.peek() {
            Some(t @ Token {
                kind: TokenKind::Ident(_),
                ..
            }) => {
                self.pos += 1;
                Ok(t)
            }
            Some(t) => Err(self.error(format!("expected {what}, found {}", t.kind.describe()))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn ident_text(&mut self, what: &str) -> Result<String, CompileError> {
        match &self.ident(what)?.kind {
            TokenKind::Ident(s) => Ok(s.clone()),
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn keyword(&mut self, word: &str) -> Result<(), CompileError> {
        let found = self.ident_text(&format!("`{word}`"))?;
        if found != word {
            self.pos -= 1;
            return Err(self.error(format!("expected `{word}`, found `{found}`")));
        }
        Ok(())
    }

    fn string(&mut self, what: &str) -> Result<String, CompileError> {
        let tok = self.next(what)?;
        match &tok.kind {
            TokenKind::Str(s) => Ok(s.clone()),
            other => {
                self.pos -= 1;
                Err(self.error(format!("expected {what}, found {}", other.describe())))
            }
        }
    }

    fn integer(&mut self, what: &str) -> Result<u64, CompileError> {
        let tok = self.next(what)?;
        match &tok.kind {
            TokenKind::Int(n) => Ok(*n),
            other => {
                self.pos -= 1;
                Err(self.error(format!("expected {what}, found {}", other.describe())))
            }
        }
    }

    fn header(&mut self) -> Result<(String, String, u64), CompileError> {
        if !matches!(self.peek(), Some(Token { kind: TokenKind::Ident(s), .. }) if s == "lac") {
            return Err(self.error("expected `lac v1;` header"));
        }
        self.pos += 1;
        let version = self.ident_text("grammar version")?;
        if version != GRAMMAR_VERSION {
            self.pos -= 1;
            return Err(self.error(format!("unsupported grammar version `{version}`")));
        }
        self.expect(TokenKind::Semi)?;
        self.keyword("policy")?;
        let name = self.string("policy name")?;
        self.keyword("tenant")?;
        let tenant = self.string("tenant name")?;
        self.keyword("version")?;
        let version = self.integer("policy version")?;
        self.expect(TokenKind::Semi)?;
        if tenant.is_empty() {
            return Err(self.error("tenant name must not be empty"));
        }
        Ok((name, tenant, version))
    }

    fn action_list(&mut self) -> Result<ActionSet, CompileError> {
        let mut set = ActionSet::EMPTY;
        loop {
            let tok = self.ident("action")?;
            let TokenKind::Ident(raw) = &tok.kind else {
                return Err(self.error("expected action"));
            };
            let action = Action::parse(raw).ok_or_else(|| CompileError::UnknownAction {
                action: raw.clone(),
                line: tok.line,
                col: tok.col,
            })?;
            set.insert(action);
            if !self.eat(&TokenKind::Comma) {
                return Ok(set);
            }
        }
    }

    fn string_list(&mut self, what: &str) -> Result<Vec<String>, CompileError> {
        let mut out = vec![self.string(what)?];
        while self.eat(&TokenKind::Comma) {
            out.push(self.string(what)?);
        }
        Ok(out)
    }

    fn condition(&mut self) -> Result<Condition, CompileError> {
        let scope_tok = self.ident("attribute scope")?;
        let TokenKind::Ident(scope_raw) = &scope_tok.kind else {
            return Err(self.error("expected attribute scope"));
        };
        let scope = Scope::parse(scope_raw).ok_or_else(|| CompileError::GrammarError {
            line: scope_tok.line,
            col: scope_tok.col,
            message: format!(
                "unknown attribute scope `{scope_raw}`; expected subject, resource or context"
            ),
        })?;
        self.expect(TokenKind::Dot)?;
        let key = self.ident_text("attribute name")?;
        let op = match self.next("comparison")?.kind.clone() {
            TokenKind::EqEq => CondOp::Eq(self.string("comparison value")?),
            TokenKind::NotEq => CondOp::Ne(self.string("comparison value")?),
            TokenKind::Ident(w) if w == "in" => {
                self.expect(TokenKind::LBracket)?;
                let values = self.string_list("set member")?;
                self.expect(TokenKind::RBracket)?;
                CondOp::In(values)
            }
            other => {
                self.pos -= 1;
                return Err(self.error(format!(
                    "expected `==`, `!=` or `in`, found {}",
                    other.describe()
                )));
            }
        };
        Ok(Condition { scope, key, op })
    }

    fn conditions(&mut self) -> Result<Vec<Condition>, CompileError> {
        let mut out = vec![self.condition()?];
        while matches!(self.peek(), Some(Token { kind: TokenKind::Ident(s), .. }) if s == "and") {
            self.pos += 1;
            out.push(self.condition()?);
        }
        Ok(out)
    }

    fn clause(&mut self, seen: &mut BTreeSet<String>) -> Result<Clause, CompileError> {
        let kind_tok = self.ident("clause keyword")?;
        let TokenKind::Ident(word) = &kind_tok.kind else {
            return Err(self.error("expected clause keyword"));
        };
        let kind = RuleKind::from_keyword(word).ok_or_else(|| CompileError::UnknownClause {
            clause: word.clone(),
            suggestion: suggest_clause(word),
            line: kind_tok.line,
            col: kind_tok.col,
        })?;
        let id_tok = self.ident("rule id")?;
        let TokenKind::Ident(id) = &id_tok.kind else {
            return Err(self.error("expected rule id"));
        };
        if !seen.insert(id.clone()) {
            return Err(CompileError::DuplicateRule {
                rule_id: id.clone(),
                line: id_tok.line,
                col: id_tok.col,
            });
        }
        self.expect(TokenKind::LBrace)?;

        let mut fields = Fields::default();
        let mut given = BTreeSet::new();
        while !self.eat(&TokenKind::RBrace) {
            let field_tok = self.ident("field name")?;
            let TokenKind::Ident(field) = &field_tok.kind else {
                return Err(self.error("expected field name"));
            };
            if !allowed_fields(kind).contains(&field.as_str()) {
                return Err(CompileError::UnknownField {
                    rule_id: id.clone(),
                    field: field.clone(),
                    line: field_tok.line,
                    col: field_tok.col,
                });
            }
            if !given.insert(field.clone()) {
                return Err(CompileError::GrammarError {
                    line: field_tok.line,
                    col: field_tok.col,
                    message: format!("field `{field}` given twice in rule `{id}`"),
                });
            }
            self.expect(TokenKind::Colon)?;
            match field.as_str() {
                "allow" | "actions" => fields.actions = Some(self.action_list()?),
                "license" => fields.license = Some(self.string("license id")?),
                "authority" => fields.authority = Some(self.string("warrant authority")?),
                "expires" => fields.expires = Some(self.integer("expiry timestamp")?),
                "require" => fields.require = Some(self.string_list("purpose")?),
                "max" => {
                    let tok = self.next("duration")?;
                    fields.max_secs = Some(match &tok.kind {
                        TokenKind::Duration(secs, _) => *secs,
                        TokenKind::Int(secs) => *secs,
                        other => {
                            self.pos -= 1;
                            return Err(
                                self.error(format!("expected duration, found {}", other.describe()))
                            );
                        }
                    });
                }
                _ => fields.conditions = Some(self.conditions()?),
            }
            self.expect(TokenKind::Semi)?;
        }

        let missing = |field: &str| CompileError::MissingField {
            rule_id: id.clone(),
            field: field.to_string(),
        };
        let action_field = if kind.is_allowing() { "allow" } else { "actions" };
        let actions = fields.actions.ok_or_else(|| missing(action_field))?;
        let conditions = fields.conditions.unwrap_or_default();
        let body = match kind {
            RuleKind::License => ClauseBody::License {
                license: fields.license.ok_or_else(|| missing("license"))?,
                allow: actions,
                conditions,
            },
            RuleKind::Warrant => ClauseBody::Warrant {
                authority: fields.authority.ok_or_else(|| missing("authority"))?,
                allow: actions,
                expires: fields.expires,
                conditions,
            },
            RuleKind::Purpose => ClauseBody::Purpose {
                actions,
                require: fields.require.ok_or_else(|| missing("require"))?,
            },
            RuleKind::Retention => ClauseBody::Retention {
                actions,
                max_secs: fields.max_secs.ok_or_else(|| missing("max"))?,
            },
            RuleKind::Grant => ClauseBody::Grant {
                allow: actions,
                conditions,
            },
            RuleKind::Deny => ClauseBody::Deny {
                actions,
                conditions,
            },
        };
        Ok(Clause {
            id: id.clone(),
            body,
            line: kind_tok.line,
            col: kind_tok.col,
        })
    }
}

pub fn parse(tokens: &[Token]) -> Result<PolicySource, CompileError> {
    let mut p = Parser { tokens, pos: 0 };
    let (name, tenant, version) = p.header()?;
    let mut seen = BTreeSet::new();
    let mut clauses = Vec::new();
    while p.peek().is_some() {
        clauses.push(p.clause(&mut seen)?);
    }
    Ok(PolicySource {
        name,
        tenant,
        version,
        clauses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::lexer::tokenize;

    fn parse_src(src: &str) -> Result<PolicySource, CompileError> {
        parse(&tokenize(src)?)
    }

    const HEADER: &str = "lac v1;\npolicy \"p\" tenant \"acme\" version 2;\n";

    #[test]
    fn parses_every_clause_kind() {
        let src = format!(
            "{HEADER}
            license l1 {{ license: \"CC-BY\"; allow: read, export; }}
            warrant w1 {{ authority: \"court-7\"; allow: read; expires: 1800000000; }}
            purpose p1 {{ actions: read; require: \"research\", \"audit\"; }}
            retention r1 {{ actions: read, export; max: 30d; }}
            grant g1 {{ allow: read; where: subject.role == \"analyst\" and resource.tier in [\"a\", \"b\"]; }}
            deny d1 {{ actions: delete; where: subject.status != \"active\"; }}"
        );
        let parsed = parse_src(&src).unwrap();
        assert_eq!(parsed.tenant, "acme");
        assert_eq!(parsed.version, 2);
        let kinds: Vec<RuleKind> = parsed.clauses.iter().map(|c| c.body.kind()).collect();
        assert_eq!(kinds, RuleKind::ALL.to_vec());
        let ClauseBody::Grant { conditions, .. } = &parsed.clauses[4].body else {
            panic!("expected grant");
        };
        assert_eq!(conditions.len(), 2);
        assert_eq!(
            conditions[1].op,
            CondOp::In(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn misspelled_clause_gets_suggestion() {
        let err = parse_src(&format!("{HEADER}licence l1 {{ license: \"x\"; allow: read; }}"))
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownClause {
                clause: "licence".into(),
                suggestion: Some("license".into()),
                line: 3,
                col: 1
            }
        );
    }

    #[test]
    fn unknown_field_and_action_are_reported() {
        let err = parse_src(&format!("{HEADER}grant g {{ allow: read; colour: \"red\"; }}"))
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownField { ref field, .. } if field == "colour"));
        let err = parse_src(&format!("{HEADER}grant g {{ allow: fly; }}")).unwrap_err();
        assert!(matches!(err, CompileError::UnknownAction { ref action, .. } if action == "fly"));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let err = parse_src(&format!("{HEADER}license l {{ allow: read; }}")).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingField {
                rule_id: "l".into(),
                field: "license".into()
            }
        );
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let err = parse_src(&format!(
            "{HEADER}grant g {{ allow: read; }}\ngrant g {{ allow: write; }}"
        ))
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateRule { ref rule_id, line: 4, .. } if rule_id == "g"));
    }

    #[test]
    fn header_is_required() {
        assert!(matches!(
            parse_src("policy \"p\" tenant \"t\" version 1;"),
            Err(CompileError::GrammarError { line: 1, col: 1, .. })
        ));
        assert!(parse_src("lac v2; policy \"p\" tenant \"t\" version 1;").is_err());
    }

    #[test]
    fn truncated_clause_reports_grammar_error() {
        assert!(matches!(
            parse_src(&format!("{HEADER}grant g {{ allow: read")),
            Err(CompileError::GrammarError { .. })
        ));
    }
}
