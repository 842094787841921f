//! Parser for `<% ... %>` expressions.
//!
//! Grammar, loosely:
//!
//! ```text
//! pipeline := command ('|' command)*
//! command  := IDENT operand*          function call
//!           | operand
//! operand  := FIELD | '$' FIELD? | STRING | RAW | NUMBER
//!           | true | false | nil | '(' pipeline ')'
//! ```
//!
//! The value of each command feeds the next as its last argument.

use crate::core::error::TemplateError;
use crate::core::value::Value;

pub(crate) const OPEN: &str = "<%";
pub(crate) const CLOSE: &str = "%>";

/// A parsed template: literal text interleaved with expressions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Template {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    Expr {
        line: usize,
        source: String,
        pipeline: Pipeline,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Call { name: String, args: Vec<Operand> },
    Operand(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    /// `.A.b`; the empty path is the root
    Field(Vec<String>),
    Literal(Value),
    Nested(Pipeline),
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = text;
        let mut line = 1;
        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            line += rest[..start].matches('\n').count();
            let body_start = start + OPEN.len();
            let body_len = find_close(&rest[body_start..]).ok_or_else(|| TemplateError::Syntax {
                line,
                message: format!("unclosed `{OPEN}`"),
            })?;
            let body = &rest[body_start..body_start + body_len];
            let pipeline = Parser::new(body, line)?.parse_all()?;
            segments.push(Segment::Expr {
                line,
                source: body.trim().to_string(),
                pipeline,
            });
            line += body.matches('\n').count();
            rest = &rest[body_start + body_len + CLOSE.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn has_expressions(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Expr { .. }))
    }
}

/// Byte offset of the closing delimiter, skipping quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            b'%' if bytes.get(i + 1) == Some(&b'>') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Number(serde_json::Number),
    Pipe,
    LParen,
    RParen,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn lex(src: &str, line: usize) -> Result<Vec<Token>, TemplateError> {
    let err = |message: String| TemplateError::Syntax { line, message };
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' | '$' => {
                if c == '$' {
                    i += 1;
                    if chars.get(i) != Some(&'.') {
                        tokens.push(Token::Field(Vec::new()));
                        continue;
                    }
                }
                let mut path = Vec::new();
                // `.` alone is the root
                while chars.get(i) == Some(&'.') {
                    i += 1;
                    let start = i;
                    while i < chars.len() && is_segment_char(chars[i]) {
                        i += 1;
                    }
                    if start == i {
                        if path.is_empty() && chars.get(i).is_none_or(|c| !c.is_alphanumeric()) {
                            break;
                        }
                        return Err(err(format!("empty field name in `{src}`")));
                    }
                    path.push(chars[start..i].iter().collect());
                }
                tokens.push(Token::Field(path));
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string".to_string())),
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some('r') => '\r',
                                Some('\\') => '\\',
                                Some('"') => '"',
                                Some(other) => return Err(err(format!("unknown escape `\\{other}`"))),
                                None => return Err(err("unterminated string".to_string())),
                            };
                            s.push(escaped);
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .ok_or_else(|| err("unterminated raw string".to_string()))?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if let Ok(n) = text.parse::<i64>() {
                    serde_json::Number::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .ok_or_else(|| err(format!("bad number `{text}`")))?
                };
                tokens.push(Token::Number(number));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn new(src: &str, line: usize) -> Result<Self, TemplateError> {
        Ok(Self {
            tokens: lex(src, line)?,
            pos: 0,
            line,
        })
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_all(mut self) -> Result<Pipeline, TemplateError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let pipeline = self.pipeline()?;
        match self.peek() {
            None => Ok(pipeline),
            Some(token) => Err(self.error(format!("unexpected {token:?}"))),
        }
    }

    fn pipeline(&mut self) -> Result<Pipeline, TemplateError> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            commands.push(self.command()?);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        if let Some(Token::Ident(name)) = self.peek() {
            if !matches!(name.as_str(), "true" | "false" | "nil") {
                let name = name.clone();
                self.pos += 1;
                let mut args = Vec::new();
                while let Some(token) = self.peek() {
                    if matches!(token, Token::Pipe | Token::RParen) {
                        break;
                    }
                    args.push(self.operand()?);
                }
                return Ok(Command::Call { name, args });
            }
        }
        let operand = self.operand()?;
        match self.peek() {
            None | Some(Token::Pipe) | Some(Token::RParen) => Ok(Command::Operand(operand)),
            Some(token) => Err(self.error(format!("unexpected {token:?} after operand"))),
        }
    }

    fn operand(&mut self) -> Result<Operand, TemplateError> {
        match self.next() {
            Some(Token::Field(path)) => Ok(Operand::Field(path)),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Operand::Literal(Value::Number(n))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Operand::Literal(Value::Bool(true))),
                "false" => Ok(Operand::Literal(Value::Bool(false))),
                "nil" => Ok(Operand::Literal(Value::Null)),
                // a bare function name as an argument is a call without args
                _ => Ok(Operand::Nested(Pipeline {
                    commands: vec![Command::Call {
                        name: word,
                        args: Vec::new(),
                    }],
                })),
            },
            Some(Token::LParen) => {
                let inner = self.pipeline()?;
                match self.next() {
                    Some(Token::RParen) => Ok(Operand::Nested(inner)),
                    _ => Err(self.error("missing `)`")),
                }
            }
            Some(token) => Err(self.error(format!("unexpected {token:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(src: &str) -> Pipeline {
        let template = Template::parse(&format!("<% {src} %>")).unwrap();
        match template.segments.into_iter().next().unwrap() {
            Segment::Expr { pipeline, .. } => pipeline,
            other => panic!("expected expression, got {other:?}"),
        }
    }

    fn field(path: &[&str]) -> Operand {
        Operand::Field(path.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_text_and_expressions() {
        let t = Template::parse("a: <% .Global.x %>\nb: plain\n").unwrap();
        assert_eq!(t.segments.len(), 3);
        assert_eq!(t.segments[0], Segment::Text("a: ".into()));
        assert!(t.has_expressions());
        assert!(!Template::parse("no templates here").unwrap().has_expressions());
    }

    #[test]
    fn test_field_paths() {
        assert_eq!(expr(".").commands, vec![Command::Operand(field(&[]))]);
        assert_eq!(
            expr(".Groups.site.my-api").commands,
            vec![Command::Operand(field(&["Groups", "site", "my-api"]))]
        );
        assert_eq!(expr("$.Vars.a").commands, vec![Command::Operand(field(&["Vars", "a"]))]);
    }

    #[test]
    fn test_call_with_literals() {
        let p = expr(r#"replace "a" `b\n` .X"#);
        assert_eq!(
            p.commands,
            vec![Command::Call {
                name: "replace".into(),
                args: vec![
                    Operand::Literal(Value::from("a")),
                    Operand::Literal(Value::from("b\\n")),
                    field(&["X"]),
                ],
            }]
        );
    }

    #[test]
    fn test_pipes_and_parens() {
        let p = expr(r#"(env "HOME") | quote | indent 2"#);
        assert_eq!(p.commands.len(), 3);
        assert!(matches!(&p.commands[0], Command::Operand(Operand::Nested(_))));
        assert!(matches!(&p.commands[2], Command::Call { name, args } if name == "indent" && args.len() == 1));
    }

    #[test]
    fn test_numbers_and_keywords() {
        let p = expr("default nil -3");
        let Command::Call { args, .. } = &p.commands[0] else {
            panic!("expected call");
        };
        assert_eq!(args[0], Operand::Literal(Value::Null));
        assert_eq!(args[1], Operand::Literal(Value::from(-3)));
    }

    #[test]
    fn test_close_inside_string_is_literal() {
        let t = Template::parse(r#"<% quote "50%>" %>!"#).unwrap();
        assert_eq!(t.segments.len(), 2);
        assert_eq!(t.segments[1], Segment::Text("!".into()));
    }

    #[test]
    fn test_line_numbers() {
        let t = Template::parse("a\nb\n<% .X %>\n<% .Y %>").unwrap();
        let lines: Vec<_> = t
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::Expr { line, .. } => Some(*line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![3, 4]);
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["<% .X", "<% %>", "<% quote \"x %>", "<% .X .Y %>", "<% (quote .X %>", "<% # %>"] {
            let err = Template::parse(bad).unwrap_err();
            assert!(matches!(err, TemplateError::Syntax { .. }), "{bad}: {err}");
        }
    }
}
