//! Tag extraction from IEC 61131-3 structured text.
//!
//! Only declaration blocks are read (`VAR`, `VAR_INPUT`, `VAR_OUTPUT`,
//! `VAR_IN_OUT`, `VAR_GLOBAL`, `VAR_TEMP`, `VAR_EXTERNAL`). Each declaration
//! has the form
//!
//! ```text
//! Name1, Name2 [AT %IX0.0] : TYPE [:= initial];  (* description *)
//! ```
//!
//! and becomes one tag per name. Program bodies are skipped.

use std::fmt;
use tagsync_core::Tag;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

struct Line {
    number: usize,
    code: String,
    comment: Option<String>,
}

/// Split each line into code and comment text. `(* *)` comments may span
/// lines; `//` runs to end of line.
fn split_comments(source: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut in_block = false;
    for (i, raw) in source.lines().enumerate() {
        let mut code = String::new();
        let mut comment = String::new();
        let mut rest = raw;
        loop {
            if in_block {
                match rest.find("*)") {
                    Some(end) => {
                        comment.push_str(&rest[..end]);
                        rest = &rest[end + 2..];
                        in_block = false;
                    }
                    None => {
                        comment.push_str(rest);
                        break;
                    }
                }
                continue;
            }
            let block = rest.find("(*");
            let line = rest.find("//");
            match (block, line) {
                (Some(b), l) if l.is_none_or(|l| b < l) => {
                    code.push_str(&rest[..b]);
                    rest = &rest[b + 2..];
                    in_block = true;
                }
                (_, Some(l)) => {
                    code.push_str(&rest[..l]);
                    comment.push_str(&rest[l + 2..]);
                    break;
                }
                _ => {
                    code.push_str(rest);
                    break;
                }
            }
        }
        let comment = comment.trim();
        lines.push(Line {
            number: i + 1,
            code,
            comment: (!comment.is_empty()).then(|| comment.to_string()),
        });
    }
    lines
}

fn scope_of(keyword: &str) -> Option<&'static str> {
    match keyword {
        "VAR" => Some("local"),
        "VAR_INPUT" => Some("input"),
        "VAR_OUTPUT" => Some("output"),
        "VAR_IN_OUT" => Some("in_out"),
        "VAR_GLOBAL" => Some("global"),
        "VAR_TEMP" => Some("temp"),
        "VAR_EXTERNAL" => Some("external"),
        _ => None,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Block {
    scope: &'static str,
    constant: bool,
}

fn parse_declaration(
    text: &str,
    line: usize,
    block: &Block,
    description: Option<&str>,
) -> Result<Vec<Tag>, ParseError> {
    let err = |message: String| ParseError { line, message };

    // The first ':' that does not start ':='.
    let colon = text
        .char_indices()
        .find(|&(i, c)| c == ':' && !text[i + 1..].starts_with('='))
        .map(|(i, _)| i)
        .ok_or_else(|| err(format!("expected ':' in declaration '{text}'")))?;
    let (lhs, rhs) = (&text[..colon], &text[colon + 1..]);

    let (names, address) = match lhs.to_ascii_uppercase().find(" AT ") {
        Some(at) => (&lhs[..at], Some(lhs[at + 4..].trim().to_string())),
        None => (lhs, None),
    };
    let (data_type, initial) = match rhs.split_once(":=") {
        Some((ty, init)) => (ty.trim(), Some(init.trim())),
        None => (rhs.trim(), None),
    };
    if data_type.is_empty() {
        return Err(err("missing data type".into()));
    }

    let mut tags = Vec::new();
    for name in names.split(',').map(str::trim) {
        if !is_identifier(name) {
            return Err(err(format!("invalid tag name '{name}'")));
        }
        let mut tag = Tag::new(name).with_data_type(data_type);
        tag.address = address.clone();
        tag.description = description.map(str::to_string);
        tag.extra.insert("scope".into(), block.scope.into());
        if block.constant {
            tag.extra.insert("constant".into(), true.into());
        }
        if let Some(initial) = initial {
            tag.extra.insert("initialValue".into(), initial.into());
        }
        tags.push(tag);
    }
    Ok(tags)
}

pub fn parse(source: &str) -> Result<Vec<Tag>, ParseError> {
    let mut tags = Vec::new();
    let mut block: Option<(Block, usize)> = None;
    let mut pending = String::new();
    let mut pending_line = 0;

    for line in split_comments(source) {
        let text = line.code.trim();
        if text.is_empty() {
            continue;
        }
        let keyword = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        let Some((current, _)) = &block else {
            if let Some(scope) = scope_of(&keyword) {
                let constant = text.to_ascii_uppercase().split_whitespace().any(|w| w == "CONSTANT");
                block = Some((Block { scope, constant }, line.number));
            }
            continue;
        };

        if keyword.trim_end_matches(';') == "END_VAR" {
            if !pending.trim().is_empty() {
                return Err(ParseError {
                    line: pending_line,
                    message: "declaration missing ';'".into(),
                });
            }
            block = None;
            continue;
        }

        let mut statements = text.split(';').peekable();
        while let Some(part) = statements.next() {
            let terminated = statements.peek().is_some();
            if pending.trim().is_empty() {
                pending_line = line.number;
            }
            pending.push(' ');
            pending.push_str(part);
            if !terminated {
                break;
            }
            let declaration = pending.trim().to_string();
            pending.clear();
            if declaration.is_empty() {
                continue;
            }
            // A trailing comment describes the last declaration on its line.
            let last = statements.peek().is_some_and(|rest| rest.trim().is_empty());
            let description = if last { line.comment.as_deref() } else { None };
            tags.extend(parse_declaration(&declaration, pending_line, current, description)?);
        }
    }

    match block {
        Some((_, start)) => Err(ParseError {
            line: start,
            message: "VAR block is never closed with END_VAR".into(),
        }),
        None => Ok(tags),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOTOR: &str = r#"
PROGRAM Main
VAR_INPUT
    Start, Stop AT %IX0.1 : BOOL;   (* operator buttons *)
END_VAR
VAR
    Speed : REAL := 0.0; // rpm
    Fault : BOOL;
    (* a comment
       spanning lines *)
    Recipe :
        ARRAY[1..10] OF INT;
END_VAR
VAR CONSTANT
    MaxSpeed : REAL := 1500.0;
END_VAR
Speed := Speed + 1.0;
END_PROGRAM
"#;

    #[test]
    fn parses_declaration_blocks() {
        let tags = parse(MOTOR).unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Start", "Stop", "Speed", "Fault", "Recipe", "MaxSpeed"]);

        assert_eq!(tags[1].address.as_deref(), Some("%IX0.1"));
        assert_eq!(tags[1].data_type.as_deref(), Some("BOOL"));
        assert_eq!(tags[1].description.as_deref(), Some("operator buttons"));
        assert_eq!(tags[1].extra["scope"], "input");

        assert_eq!(tags[2].description.as_deref(), Some("rpm"));
        assert_eq!(tags[2].extra["initialValue"], "0.0");
        assert_eq!(tags[3].description, None);
        assert_eq!(tags[4].data_type.as_deref(), Some("ARRAY[1..10] OF INT"));
        assert_eq!(tags[5].extra["constant"], true);
    }

    #[test]
    fn ignores_code_outside_blocks() {
        assert!(parse("x := 1;\nIF x > 0 THEN y := 2; END_IF;").unwrap().is_empty());
    }

    #[test]
    fn reports_unclosed_block() {
        let err = parse("VAR\n  a : INT;\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn reports_bad_declarations() {
        let err = parse("VAR\n  a INT;\nEND_VAR").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(parse("VAR\n  1a : INT;\nEND_VAR").is_err());
        assert!(parse("VAR\n  a : ;\nEND_VAR").is_err());
        assert!(parse("VAR\n  a : INT\nEND_VAR").is_err());
    }
}
