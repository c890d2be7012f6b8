//! # Call-Graph Extraction
//!
//! Finds the name-only calls a script makes, keyed by callee, with one
//! representative signature each. Purely syntactic: nothing is executed.
//!
//! Rules:
//! - `name(args)` records the call text; later calls overwrite earlier ones.
//!   Method calls (`x.name()`), namespaced calls (`ns::name()`) and `fn` items
//!   are not calls.
//! - A statement `let x = name(args);` (also `const`, or a bare `x = ...`)
//!   records the whole assignment for `name`, and that form wins over any
//!   bare call of the same name.
//! - Nested calls are recorded innermost first.
//! - Interpolations in backtick strings (`${...}`) are code and are scanned.

use crate::error::{parse_failed, Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Callee name to representative signature, in first-seen order.
pub type CallGraph = IndexMap<String, String>;

const KEYWORDS: &[&str] = &[
    "if", "else", "while", "loop", "for", "in", "do", "until", "return", "throw", "try",
    "catch", "let", "const", "fn", "private", "import", "export", "as", "switch", "break",
    "continue", "global", "this", "true", "false",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

/// Reject sources Rhai cannot parse.
pub fn check_syntax(source: &str) -> Result<()> {
    rhai::Engine::new_raw()
        .compile(source)
        .map(|_| ())
        .map_err(|e| parse_failed(e).with_operation("callgraph::check_syntax"))
}

/// Extract the call graph of a whole script.
pub fn extract_calls(source: &str) -> Result<CallGraph> {
    check_syntax(source)?;
    let tokens = tokenize(source)?;
    let pairs = match_pairs(&tokens)?;

    let mut calls = CallGraph::new();
    let mut open: Vec<Option<usize>> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token.text {
            "(" => open.push(callee_before(&tokens, i)),
            ")" => {
                if let Some(Some(callee)) = open.pop() {
                    calls.insert(tokens[callee].text.to_string(), render(source, &tokens[callee..=i]));
                }
            }
            _ => {}
        }
    }

    let mut assigns: HashMap<&str, String> = HashMap::new();
    for start in statement_starts(&tokens) {
        if let Some((callee, end)) = call_assignment(&tokens, &pairs, start) {
            assigns.insert(tokens[callee].text, render(source, &tokens[start..=end]));
        }
    }
    for (name, signature) in calls.iter_mut() {
        if let Some(assign) = assigns.remove(name.as_str()) {
            *signature = assign;
        }
    }

    Ok(calls)
}

/// Names of every `fn` item defined in the script.
pub fn defined_functions(source: &str) -> Result<Vec<String>> {
    let tokens = tokenize(source)?;
    Ok(tokens
        .windows(2)
        .filter(|w| w[0].text == "fn" && w[1].kind == TokenKind::Ident)
        .map(|w| w[1].text.to_string())
        .collect())
}

/// The text between the braces of `fn name(...) { ... }`, if defined.
pub fn function_body<'a>(source: &'a str, name: &str) -> Result<Option<&'a str>> {
    let tokens = tokenize(source)?;
    let pairs = match_pairs(&tokens)?;

    for i in 0..tokens.len().saturating_sub(2) {
        if tokens[i].text != "fn" || tokens[i + 1].text != name || tokens[i + 2].text != "(" {
            continue;
        }
        let Some(&close_paren) = pairs.get(&(i + 2)) else {
            continue;
        };
        let open_brace = close_paren + 1;
        if tokens.get(open_brace).map(|t| t.text) != Some("{") {
            continue;
        }
        if let Some(&close_brace) = pairs.get(&open_brace) {
            return Ok(Some(&source[tokens[open_brace].end..tokens[close_brace].start]));
        }
    }
    Ok(None)
}

// ============================================================================
// Call and statement recognition
// ============================================================================

/// Index of the callee if the `(` at `open` starts a name-only call.
fn callee_before(tokens: &[Token], open: usize) -> Option<usize> {
    let callee = open.checked_sub(1)?;
    let token = &tokens[callee];
    if token.kind != TokenKind::Ident || is_keyword(token.text) {
        return None;
    }
    if let Some(prev) = callee.checked_sub(1) {
        if matches!(tokens[prev].text, "." | "?." | "::" | "fn") {
            return None;
        }
    }
    Some(callee)
}

fn statement_starts(tokens: &[Token]) -> Vec<usize> {
    let mut starts = vec![0];
    for (i, token) in tokens.iter().enumerate() {
        if matches!(token.text, ";" | "{" | "}" | "#{") && i + 1 < tokens.len() {
            starts.push(i + 1);
        }
    }
    starts
}

/// `[let|const] target = name(...)` ending the statement.
/// Returns the callee index and the closing paren index.
fn call_assignment(tokens: &[Token], pairs: &HashMap<usize, usize>, start: usize) -> Option<(usize, usize)> {
    let mut i = start;
    if matches!(tokens.get(i)?.text, "let" | "const") {
        i += 1;
    }
    if tokens.get(i)?.kind != TokenKind::Ident || is_keyword(tokens[i].text) {
        return None;
    }

    // Assignment target: a name, with optional `.field` / `[index]` suffixes
    i += 1;
    loop {
        match tokens.get(i)?.text {
            "=" => break,
            "." => i += 2,
            "[" => i = *pairs.get(&i)? + 1,
            _ => return None,
        }
    }

    let callee = i + 1;
    let open = callee + 1;
    if tokens.get(open)?.text != "(" || callee_before(tokens, open) != Some(callee) {
        return None;
    }
    let close = *pairs.get(&open)?;
    match tokens.get(close + 1).map(|t| t.text) {
        None | Some(";") | Some("}") => Some((callee, close)),
        _ => None,
    }
}

/// Source text of a token run, with every gap collapsed to one space.
fn render(source: &str, tokens: &[Token]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && token.start > tokens[i - 1].end {
            out.push(' ');
        }
        out.push_str(&source[token.start..token.end]);
    }
    out
}

/// Pair every opening bracket with its closer, keyed by opener index.
fn match_pairs(tokens: &[Token]) -> Result<HashMap<usize, usize>> {
    let mut pairs = HashMap::new();
    let mut stack: Vec<(usize, &str)> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let expected = match token.text {
            "(" | "[" | "{" | "#{" | "?[" => {
                stack.push((i, token.text));
                continue;
            }
            ")" => "(",
            "]" => "[",
            "}" => "{",
            _ => continue,
        };
        let (open, opener) = stack
            .pop()
            .ok_or_else(|| unbalanced(token))?;
        let matches = match expected {
            "(" => opener == "(",
            "[" => opener == "[" || opener == "?[",
            _ => opener == "{" || opener == "#{",
        };
        if !matches {
            return Err(unbalanced(token));
        }
        pairs.insert(open, i);
    }
    match stack.last() {
        Some(&(open, _)) => Err(unbalanced(&tokens[open])),
        None => Ok(pairs),
    }
}

fn unbalanced(token: &Token) -> Error {
    Error::parse_failed(format!("unbalanced '{}'", token.text))
        .with_operation("callgraph::match_pairs")
        .with_context("offset", token.start.to_string())
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Str,
    Punct,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    start: usize,
    end: usize,
}

const OPERATORS: &[&str] = &[
    "**=", "<<=", ">>=", "..=", "::", "?.", "?[", "??", "==", "!=", "<=", ">=", "&&", "||",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "**", "<<", ">>", "..", "=>", "->", "#{",
];

fn tokenize(source: &str) -> Result<Vec<Token<'_>>> {
    let mut lexer = Lexer {
        source,
        bytes: source.as_bytes(),
        tokens: Vec::new(),
    };
    lexer.lex(0, false)?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    tokens: Vec<Token<'a>>,
}

impl<'a> Lexer<'a> {
    fn push(&mut self, kind: TokenKind, start: usize, end: usize) {
        self.tokens.push(Token {
            kind,
            text: &self.source[start..end],
            start,
            end,
        });
    }

    /// Lex code from `i`. Inside an interpolation, stops at the `}` closing
    /// it and returns its offset.
    fn lex(&mut self, mut i: usize, interpolation: bool) -> Result<usize> {
        let (source, bytes) = (self.source, self.bytes);
        let mut depth = 0usize;

        while i < bytes.len() {
            let c = bytes[i];
            let start = i;

            if c.is_ascii_whitespace() {
                i += 1;
                continue;
            }

            if source[i..].starts_with("//") {
                i = source[i..].find('\n').map_or(bytes.len(), |n| i + n);
                continue;
            }

            if source[i..].starts_with("/*") {
                i = skip_block_comment(source, i)?;
                continue;
            }

            if c == b'`' {
                i = self.template(i)?;
                continue;
            }

            let kind = if c == b'_' || c.is_ascii_alphabetic() || c >= 0x80 {
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric() || bytes[i] >= 0x80) {
                    i += 1;
                }
                TokenKind::Ident
            } else if c.is_ascii_digit() {
                while i < bytes.len() {
                    let b = bytes[i];
                    let fraction = b == b'.' && bytes.get(i + 1).is_some_and(|n| n.is_ascii_digit());
                    if b.is_ascii_alphanumeric() || b == b'_' || fraction {
                        i += 1;
                    } else {
                        break;
                    }
                }
                TokenKind::Number
            } else if c == b'"' || c == b'\'' {
                i = skip_quoted(source, i, c)?;
                TokenKind::Str
            } else if c == b'#' && raw_string_hashes(bytes, i).is_some() {
                i = skip_raw_string(source, i)?;
                TokenKind::Str
            } else {
                let op = OPERATORS.iter().find(|op| source[i..].starts_with(**op));
                i += op.map_or(1, |op| op.len());
                TokenKind::Punct
            };

            if interpolation && kind == TokenKind::Punct {
                match &source[start..i] {
                    "{" | "#{" => depth += 1,
                    "}" if depth == 0 => return Ok(start),
                    "}" => depth -= 1,
                    _ => {}
                }
            }
            self.push(kind, start, i);
        }

        if interpolation {
            return Err(lex_error("unterminated interpolation", i));
        }
        Ok(i)
    }

    /// Backtick string: literal runs become string tokens, `${...}` is code.
    fn template(&mut self, start: usize) -> Result<usize> {
        let bytes = self.bytes;
        let mut run = start;
        let mut i = start + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'`' => {
                    self.push(TokenKind::Str, run, i + 1);
                    return Ok(i + 1);
                }
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    self.push(TokenKind::Str, run, i + 2);
                    let close = self.lex(i + 2, true)?;
                    run = close;
                    i = close + 1;
                }
                _ => i += 1,
            }
        }
        Err(lex_error("unterminated string", start))
    }
}

fn lex_error(message: &str, offset: usize) -> Error {
    Error::parse_failed(message)
        .with_operation("callgraph::tokenize")
        .with_context("offset", offset.to_string())
}

/// Block comments nest.
fn skip_block_comment(source: &str, start: usize) -> Result<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if bytes[i..].starts_with(b"*/") {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return Ok(i);
            }
        } else {
            i += 1;
        }
    }
    Err(lex_error("unterminated block comment", start))
}

fn skip_quoted(source: &str, start: usize, quote: u8) -> Result<usize> {
    let bytes = source.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(lex_error("unterminated string", start))
}

/// Number of `#` before the opening quote of a raw string `#"..."#`.
fn raw_string_hashes(bytes: &[u8], start: usize) -> Option<usize> {
    let hashes = bytes[start..].iter().take_while(|b| **b == b'#').count();
    (bytes.get(start + hashes) == Some(&b'"')).then_some(hashes)
}

fn skip_raw_string(source: &str, start: usize) -> Result<usize> {
    let bytes = source.as_bytes();
    let hashes = raw_string_hashes(bytes, start).unwrap_or(0);
    let closing = format!("\"{}", "#".repeat(hashes));
    let body = start + hashes + 1;
    source[body..]
        .find(&closing)
        .map(|n| body + n + closing.len())
        .ok_or_else(|| lex_error("unterminated raw string", start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmprog_error::ErrorKind;

    #[test]
    fn test_assignment_form_wins() {
        let calls = extract_calls("foo(1);\nfoo(2);\nlet x = foo(3);").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls["foo"], "let x = foo(3)");
    }

    #[test]
    fn test_last_bare_call_wins() {
        let calls = extract_calls("foo(1);\nfoo(2);").unwrap();
        assert_eq!(calls["foo"], "foo(2)");
    }

    #[test]
    fn test_last_assignment_wins() {
        let calls = extract_calls("let a = foo(1);\nb = foo(2);\nfoo(3);").unwrap();
        assert_eq!(calls["foo"], "b = foo(2)");
    }

    #[test]
    fn test_nested_calls_recorded_innermost_first() {
        let calls = extract_calls("put_first_on_second(get_obj_pos(\"a\"), middle());").unwrap();
        let names: Vec<_> = calls.keys().cloned().collect();
        assert_eq!(names, vec!["get_obj_pos", "middle", "put_first_on_second"]);
        assert_eq!(calls["put_first_on_second"], "put_first_on_second(get_obj_pos(\"a\"), middle())");
    }

    #[test]
    fn test_methods_namespaces_and_definitions_are_not_calls() {
        let source = r#"
            fn helper(x) { x.len() }
            let names = objects.filter(|o| o.contains("block"));
            let n = utils::count(names);
            if (names.len() > 0) { say(helper(names)); }
        "#;
        let calls = extract_calls(source).unwrap();
        let names: Vec<_> = calls.keys().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["helper", "say"]);
    }

    #[test]
    fn test_call_in_expression_is_not_assignment_form() {
        let calls = extract_calls("let total = count(xs) + 1;").unwrap();
        assert_eq!(calls["count"], "count(xs)");
    }

    #[test]
    fn test_indexed_target_assignment() {
        let calls = extract_calls("let pts = [0, 0];\npts[1] = midpoint(a, b);").unwrap();
        assert_eq!(calls["midpoint"], "pts[1] = midpoint(a, b)");
    }

    #[test]
    fn test_whitespace_collapsed_and_strings_kept() {
        let calls = extract_calls("let p = parse_position(\n    \"a  point (left)\" ,\n  0.5 );").unwrap();
        assert_eq!(calls["parse_position"], "let p = parse_position( \"a  point (left)\" , 0.5 )");
    }

    #[test]
    fn test_comments_ignored() {
        let calls = extract_calls("// fake(1)\n/* other(2) /* nested() */ */\nreal(3);").unwrap();
        assert_eq!(calls.keys().collect::<Vec<_>>(), vec!["real"]);
    }

    #[test]
    fn test_no_calls_gives_empty_mapping() {
        assert!(extract_calls("let a = 1;\nlet b = a + 2;").unwrap().is_empty());
        assert!(extract_calls("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_syntax_rejected() {
        let err = extract_calls("let = (;").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFailed);
    }

    #[test]
    fn test_function_body_and_definitions() {
        let source = "fn outer(a) {\n    let b = inner(a);\n    b * 2\n}\nfn inner(x) { x + 1 }";
        assert_eq!(defined_functions(source).unwrap(), vec!["outer", "inner"]);
        assert_eq!(
            function_body(source, "outer").unwrap(),
            Some("\n    let b = inner(a);\n    b * 2\n")
        );
        assert_eq!(function_body(source, "missing").unwrap(), None);

        let body = function_body(source, "outer").unwrap().unwrap();
        assert_eq!(extract_calls(body).unwrap()["inner"], "let b = inner(a)");
    }

    #[test]
    fn test_calls_inside_interpolation() {
        let calls = extract_calls("say(`total ${get_total(objects)} of ${ if ok { count(xs) } else { 0 } }`);").unwrap();
        let names: Vec<_> = calls.keys().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["get_total", "count", "say"]);
        assert_eq!(calls["get_total"], "get_total(objects)");
        assert_eq!(calls["say"], "say(`total ${get_total(objects)} of ${ if ok { count(xs) } else { 0 } }`)");

        let calls = extract_calls("let ret_val = `${double(21)}`;").unwrap();
        assert_eq!(calls["double"], "double(21)");
    }

    #[test]
    fn test_unterminated_interpolation_rejected() {
        assert!(tokenize("`a ${f(1)").is_err());
    }

    #[test]
    fn test_quoted_text_is_not_scanned() {
        let calls = extract_calls("let s = `f(${x})`;\nlet c = '(';\nh(s, c);").unwrap();
        assert_eq!(calls.keys().collect::<Vec<_>>(), vec!["h"]);
    }
}
