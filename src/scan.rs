//! Import scanning for TypeScript/JavaScript sources.
//!
//! A single-pass token scanner extracts module specifiers without a full
//! parse. It understands just enough syntax to know when a string literal
//! sits in an import position: comments, string and template literals,
//! regex literals, and the handful of import-like constructs. Everything
//! else is skipped byte-by-byte.
//!
//! When a file contains an `nx-ignore-next-line` comment or a legacy
//! `loadChildren` string, a second pass over the recorded candidates
//! filters them with line-level bookkeeping. The second pass is strictly
//! opt-in; files without those constructs pay only for the scan itself.

use serde::Serialize;

use crate::error::ScanError;

/// Comment marker suppressing imports on the following line.
const IGNORE_MARKER: &str = "nx-ignore-next-line";

/// AMD pseudo-modules that never name a real dependency.
const AMD_PSEUDO: &[&str] = &["require", "exports", "module"];

/// Byte range of a specifier within the scanned source (quotes excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// How a specifier was referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportKind {
    /// `import ... from 'm'`, `import 'm'`, `import x = require('m')`
    Static,
    /// `import('m')`
    Dynamic,
    /// `require('m')`
    Require,
    /// `export ... from 'm'`, `export * from 'm'`
    Reexport,
    /// `define(['m'], ...)`
    Amd,
    /// `loadChildren: 'm#Routes'`
    LoadChildren,
}

/// A single extracted module reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedModule {
    pub specifier: String,
    pub span: Span,
    pub line: usize,
    pub kind: ImportKind,
}

/// A recognized comment pragma (`// @ts-check`, `/* @jsxRuntime ... */`)
/// or a triple-slash `types` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub name: String,
    pub value: Option<String>,
    pub line: usize,
}

/// Everything the scanner learned about one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub imports: Vec<ImportedModule>,
    /// `declare module 'm'` ambient declarations.
    pub ambient_modules: Vec<String>,
    /// `/// <reference path="..." />` targets.
    pub referenced_files: Vec<String>,
    pub directives: Vec<Directive>,
}

/// Scan one source file. Pure: the output depends only on the bytes.
///
/// Malformed input that leaves a string, template, or block comment open
/// at end of file yields a [`ScanError`]; callers drop the file from edge
/// contribution and surface a warning instead of aborting.
pub fn scan(source: &str) -> Result<ScanResult, ScanError> {
    let mut scanner = Scanner::new(source);
    scanner.scan_block(false)?;

    let mut result = scanner.result;

    // Opt-in second pass.
    if !scanner.ignore_marks.is_empty() {
        let suppressed = suppressed_lines(source, &scanner.ignore_marks);
        result.imports.retain(|import| !suppressed.contains(&import.line));
    }

    Ok(result)
}

/// Category of the previously seen significant token, kept to decide
/// whether `/` starts a regex literal or is a division operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastToken {
    None,
    Ident,
    Keyword,
    Value,
    Punct,
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    last: LastToken,
    result: ScanResult,
    /// Lines on which an `nx-ignore-next-line` comment ended.
    ignore_marks: Vec<usize>,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            last: LastToken::None,
            result: ScanResult::default(),
            ignore_marks: Vec::new(),
        }
    }

    /// The main dispatcher. With `stop_at_brace` the block ends at the
    /// `}` matching an already-consumed `${` or `{`.
    fn scan_block(&mut self, stop_at_brace: bool) -> Result<(), ScanError> {
        let mut depth = 0usize;

        while let Some(byte) = self.peek() {
            match byte {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                byte if byte.is_ascii_whitespace() => self.pos += 1,
                b'/' => self.slash()?,
                b'\'' | b'"' => {
                    let literal = self.string_literal(byte)?;
                    self.last = LastToken::Value;
                    self.maybe_load_children_key(literal);
                }
                b'`' => {
                    self.pos += 1;
                    self.template_literal()?;
                    self.last = LastToken::Value;
                }
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                    self.last = LastToken::Punct;
                }
                b'}' => {
                    if stop_at_brace && depth == 0 {
                        self.pos += 1;
                        return Ok(());
                    }
                    depth = depth.saturating_sub(1);
                    self.pos += 1;
                    self.last = LastToken::Value;
                }
                b')' | b']' => {
                    self.pos += 1;
                    self.last = LastToken::Value;
                }
                byte if is_ident_start(byte) => self.identifier()?,
                byte if byte.is_ascii_digit() => {
                    while self.peek().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'.') {
                        self.pos += 1;
                    }
                    self.last = LastToken::Value;
                }
                b'.' => {
                    self.pos += 1;
                    self.last = LastToken::Punct;
                }
                _ => {
                    self.pos += 1;
                    self.last = LastToken::Punct;
                }
            }
        }

        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) -> Result<(), ScanError> {
        loop {
            match self.peek() {
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(byte) if byte.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.block_comment()?,
                _ => return Ok(()),
            }
        }
    }

    // --- comments ---

    fn slash(&mut self) -> Result<(), ScanError> {
        match self.peek_at(1) {
            Some(b'/') => {
                self.line_comment();
                Ok(())
            }
            Some(b'*') => self.block_comment(),
            _ => {
                if self.regex_position() {
                    self.regex_literal();
                } else {
                    self.pos += 1;
                    self.last = LastToken::Punct;
                }
                Ok(())
            }
        }
    }

    fn line_comment(&mut self) {
        let start = self.pos + 2;
        while self.peek().is_some_and(|b| b != b'\n') {
            self.pos += 1;
        }

        let text = std::str::from_utf8(&self.src[start.min(self.pos)..self.pos])
            .unwrap_or_default()
            .trim()
            .to_string();

        self.comment_body(&text, true);
    }

    fn block_comment(&mut self) -> Result<(), ScanError> {
        let start_line = self.line;
        let start = self.pos + 2;
        self.pos += 2;

        loop {
            match self.peek() {
                None => return Err(ScanError::UnterminatedComment { line: start_line }),
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    let text = std::str::from_utf8(&self.src[start..self.pos])
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    self.pos += 2;
                    self.comment_body(&text, false);
                    return Ok(());
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn comment_body(&mut self, text: &str, line_comment: bool) {
        if text.contains(IGNORE_MARKER) {
            // The suppressed line is relative to where the comment ends.
            self.ignore_marks.push(self.line);
            return;
        }

        // Triple-slash directives arrive as a line comment whose body
        // starts with a third slash.
        if line_comment && let Some(directive) = text.strip_prefix('/') {
            let directive = directive.trim();
            if directive.starts_with("<reference") {
                if let Some(path) = xml_attribute(directive, "path") {
                    self.result.referenced_files.push(path);
                } else if let Some(types) = xml_attribute(directive, "types") {
                    self.result.directives.push(Directive {
                        name: "reference-types".to_string(),
                        value: Some(types),
                        line: self.line,
                    });
                }
                return;
            }
        }

        if let Some(pragma) = text.strip_prefix('@') {
            let mut parts = pragma.splitn(2, char::is_whitespace);
            let name = parts.next().unwrap_or_default().to_string();
            let value = parts
                .next()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from);

            if !name.is_empty() {
                self.result.directives.push(Directive {
                    name,
                    value,
                    line: self.line,
                });
            }
        }
    }

    // --- literals ---

    /// Consume a string literal, returning its content and span. A raw
    /// newline terminates the literal (invalid JS, tolerated); EOF is an
    /// error.
    fn string_literal(&mut self, quote: u8) -> Result<(String, Span), ScanError> {
        let start_line = self.line;
        self.pos += 1;
        let start = self.pos;

        loop {
            match self.peek() {
                None => return Err(ScanError::UnterminatedString { line: start_line }),
                Some(b'\\') => self.pos = (self.pos + 2).min(self.src.len()),
                Some(byte) if byte == quote => {
                    let span = Span { start, end: self.pos };
                    let content = std::str::from_utf8(&self.src[start..self.pos])
                        .unwrap_or_default()
                        .to_string();
                    self.pos += 1;
                    return Ok((content, span));
                }
                Some(b'\n') => {
                    let span = Span { start, end: self.pos };
                    let content = std::str::from_utf8(&self.src[start..self.pos])
                        .unwrap_or_default()
                        .to_string();
                    return Ok((content, span));
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Consume a template literal body (the opening backtick is already
    /// consumed). Text is skipped; `${ ... }` holes are scanned like
    /// regular code so imports inside them are still found.
    fn template_literal(&mut self) -> Result<(), ScanError> {
        let start_line = self.line;

        loop {
            match self.peek() {
                None => return Err(ScanError::UnterminatedTemplate { line: start_line }),
                Some(b'\\') => self.pos = (self.pos + 2).min(self.src.len()),
                Some(b'`') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b'$') if self.peek_at(1) == Some(b'{') => {
                    self.pos += 2;
                    self.scan_block(true)?;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn regex_position(&self) -> bool {
        matches!(
            self.last,
            LastToken::None | LastToken::Punct | LastToken::Keyword
        )
    }

    /// Skip a regex literal. A newline means the guess was wrong (regexes
    /// are single-line); scanning resumes where it stopped.
    fn regex_literal(&mut self) {
        self.pos += 1;
        let mut in_class = false;

        loop {
            match self.peek() {
                None | Some(b'\n') => return,
                Some(b'\\') => self.pos = (self.pos + 2).min(self.src.len()),
                Some(b'[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(b']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some(b'/') if !in_class => {
                    self.pos += 1;
                    self.last = LastToken::Value;
                    return;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    // --- identifiers and import forms ---

    fn identifier(&mut self) -> Result<(), ScanError> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }

        let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        let after_dot = self.src[..start]
            .iter()
            .rev()
            .find(|byte| !byte.is_ascii_whitespace())
            == Some(&b'.');

        match word {
            "import" if !after_dot => return self.import_form(),
            "export" if !after_dot => return self.export_form(),
            "require" if !after_dot => return self.require_form(),
            "define" if !after_dot => return self.define_form(),
            "declare" if !after_dot => return self.declare_form(),
            "loadChildren" => return self.load_children_form(),
            _ => {}
        }

        self.last = if is_expression_keyword(word) {
            LastToken::Keyword
        } else {
            LastToken::Ident
        };

        Ok(())
    }

    fn import_form(&mut self) -> Result<(), ScanError> {
        let keyword_line = self.line;
        self.skip_trivia()?;

        match self.peek() {
            // Dynamic import. Only plain literal arguments resolve; an
            // expression like `import('a' + b)` contributes nothing.
            Some(b'(') => {
                self.pos += 1;
                self.skip_trivia()?;
                if let Some(quote @ (b'\'' | b'"')) = self.peek() {
                    let (specifier, span) = self.string_literal(quote)?;
                    self.skip_trivia()?;
                    if matches!(self.peek(), Some(b')') | Some(b',')) {
                        self.record(specifier, span, keyword_line, ImportKind::Dynamic);
                    }
                }
                self.last = LastToken::Punct;
                Ok(())
            }
            // import.meta
            Some(b'.') => {
                self.last = LastToken::Ident;
                Ok(())
            }
            _ => self.import_statement(keyword_line),
        }
    }

    /// The clause between `import` and its source: default/namespace
    /// bindings, braces, `type`, ending at a bare string, `from 'm'`, or
    /// `= require('m')`.
    fn import_statement(&mut self, keyword_line: usize) -> Result<(), ScanError> {
        loop {
            self.skip_trivia()?;

            match self.peek() {
                Some(quote @ (b'\'' | b'"')) => {
                    let (specifier, span) = self.string_literal(quote)?;
                    self.record(specifier, span, keyword_line, ImportKind::Static);
                    self.last = LastToken::Value;
                    return Ok(());
                }
                Some(b'{') => {
                    self.pos += 1;
                    self.skip_braces()?;
                }
                Some(b'*') | Some(b',') => self.pos += 1,
                Some(b'=') => {
                    self.pos += 1;
                    return self.import_equals(keyword_line);
                }
                Some(byte) if is_ident_start(byte) => {
                    let start = self.pos;
                    while self.peek().is_some_and(is_ident_continue) {
                        self.pos += 1;
                    }
                    let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
                    match word {
                        "from" => {
                            self.skip_trivia()?;
                            if let Some(quote @ (b'\'' | b'"')) = self.peek() {
                                let (specifier, span) = self.string_literal(quote)?;
                                self.record(specifier, span, keyword_line, ImportKind::Static);
                                self.last = LastToken::Value;
                            }
                            return Ok(());
                        }
                        // `type`, `as`, and binding names all continue the clause.
                        _ => {}
                    }
                }
                // Anything else means `import` was not a declaration here.
                _ => {
                    self.last = LastToken::Ident;
                    return Ok(());
                }
            }
        }
    }

    /// `import x = require('m')`
    fn import_equals(&mut self, keyword_line: usize) -> Result<(), ScanError> {
        self.skip_trivia()?;

        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        if &self.src[start..self.pos] != b"require" {
            self.last = LastToken::Ident;
            return Ok(());
        }

        self.skip_trivia()?;
        if self.peek() == Some(b'(') {
            self.pos += 1;
            self.skip_trivia()?;
            if let Some(quote @ (b'\'' | b'"')) = self.peek() {
                let (specifier, span) = self.string_literal(quote)?;
                self.record(specifier, span, keyword_line, ImportKind::Static);
            }
        }

        self.last = LastToken::Punct;
        Ok(())
    }

    fn export_form(&mut self) -> Result<(), ScanError> {
        let keyword_line = self.line;

        // Only `export * ...`, `export { ... }` and their `type` variants
        // can carry a `from` clause; any other word means this was a plain
        // export, and scanning resumes at that word so nothing is lost.
        loop {
            self.skip_trivia()?;

            match self.peek() {
                Some(b'*') | Some(b',') => self.pos += 1,
                Some(b'{') => {
                    self.pos += 1;
                    self.skip_braces()?;
                }
                Some(byte) if is_ident_start(byte) => {
                    let start = self.pos;
                    while self.peek().is_some_and(is_ident_continue) {
                        self.pos += 1;
                    }
                    let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
                    match word {
                        "from" => {
                            self.skip_trivia()?;
                            if let Some(quote @ (b'\'' | b'"')) = self.peek() {
                                let (specifier, span) = self.string_literal(quote)?;
                                self.record(specifier, span, keyword_line, ImportKind::Reexport);
                                self.last = LastToken::Value;
                            }
                            return Ok(());
                        }
                        "type" => {}
                        "as" => self.export_binding()?,
                        _ => {
                            self.pos = start;
                            self.last = LastToken::Keyword;
                            return Ok(());
                        }
                    }
                }
                _ => {
                    self.last = LastToken::Punct;
                    return Ok(());
                }
            }
        }
    }

    /// Consume the binding after `* as`: an identifier, or (ES2022) an
    /// arbitrary string name.
    fn export_binding(&mut self) -> Result<(), ScanError> {
        self.skip_trivia()?;

        match self.peek() {
            Some(byte) if is_ident_start(byte) => {
                while self.peek().is_some_and(is_ident_continue) {
                    self.pos += 1;
                }
            }
            Some(quote @ (b'\'' | b'"')) => {
                self.string_literal(quote)?;
            }
            _ => {}
        }

        Ok(())
    }

    fn require_form(&mut self) -> Result<(), ScanError> {
        let keyword_line = self.line;
        self.skip_trivia()?;

        if self.peek() != Some(b'(') {
            // `require.resolve(...)`, `require` as a value, etc.
            self.last = LastToken::Ident;
            return Ok(());
        }

        self.pos += 1;
        self.skip_trivia()?;
        if let Some(quote @ (b'\'' | b'"')) = self.peek() {
            let (specifier, span) = self.string_literal(quote)?;
            self.skip_trivia()?;
            if matches!(self.peek(), Some(b')') | Some(b',')) {
                self.record(specifier, span, keyword_line, ImportKind::Require);
            }
        }

        self.last = LastToken::Punct;
        Ok(())
    }

    /// `define(['a', 'b'], factory)` and `define('name', ['a'], factory)`.
    fn define_form(&mut self) -> Result<(), ScanError> {
        let keyword_line = self.line;
        self.skip_trivia()?;

        if self.peek() != Some(b'(') {
            self.last = LastToken::Ident;
            return Ok(());
        }
        self.pos += 1;
        self.skip_trivia()?;

        // Optional module id.
        if let Some(quote @ (b'\'' | b'"')) = self.peek() {
            self.string_literal(quote)?;
            self.skip_trivia()?;
            if self.peek() == Some(b',') {
                self.pos += 1;
                self.skip_trivia()?;
            }
        }

        if self.peek() != Some(b'[') {
            self.last = LastToken::Punct;
            return Ok(());
        }
        self.pos += 1;

        loop {
            self.skip_trivia()?;
            match self.peek() {
                Some(quote @ (b'\'' | b'"')) => {
                    let (specifier, span) = self.string_literal(quote)?;
                    if !AMD_PSEUDO.contains(&specifier.as_str()) {
                        self.record(specifier, span, keyword_line, ImportKind::Amd);
                    }
                }
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    self.last = LastToken::Value;
                    return Ok(());
                }
                _ => {
                    self.last = LastToken::Punct;
                    return Ok(());
                }
            }
        }
    }

    /// `declare module 'm'` ambient declarations.
    fn declare_form(&mut self) -> Result<(), ScanError> {
        self.skip_trivia()?;

        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        if &self.src[start..self.pos] != b"module" {
            self.last = LastToken::Keyword;
            return Ok(());
        }

        self.skip_trivia()?;
        if let Some(quote @ (b'\'' | b'"')) = self.peek() {
            let (name, _) = self.string_literal(quote)?;
            self.result.ambient_modules.push(name);
        }

        self.last = LastToken::Ident;
        Ok(())
    }

    /// `loadChildren: 'm#Routes'` as an identifier property key.
    fn load_children_form(&mut self) -> Result<(), ScanError> {
        let keyword_line = self.line;
        self.skip_trivia()?;

        if self.peek() != Some(b':') {
            self.last = LastToken::Ident;
            return Ok(());
        }
        self.pos += 1;
        self.skip_trivia()?;

        if let Some(quote @ (b'\'' | b'"')) = self.peek() {
            let (value, span) = self.string_literal(quote)?;
            self.record_load_children(value, span, keyword_line);
            self.last = LastToken::Value;
        }

        Ok(())
    }

    /// The property key may also be a string: `'loadChildren': 'm#Routes'`.
    fn maybe_load_children_key(&mut self, literal: (String, Span)) {
        let (content, _) = literal;
        if content != "loadChildren" {
            return;
        }

        let keyword_line = self.line;
        if self.skip_trivia().is_err() || self.peek() != Some(b':') {
            return;
        }
        self.pos += 1;
        let _ = self.skip_trivia();

        if let Some(quote @ (b'\'' | b'"')) = self.peek()
            && let Ok((value, span)) = self.string_literal(quote)
        {
            self.record_load_children(value, span, keyword_line);
        }
    }

    fn record_load_children(&mut self, value: String, span: Span, line: usize) {
        // The part before `#` names the module; the rest names an export.
        let specifier = value.split('#').next().unwrap_or_default().to_string();
        if !specifier.is_empty() {
            let end = span.start + specifier.len();
            self.record(
                specifier,
                Span { start: span.start, end },
                line,
                ImportKind::LoadChildren,
            );
        }
    }

    fn skip_braces(&mut self) -> Result<(), ScanError> {
        let mut depth = 1usize;

        while depth > 0 {
            match self.peek() {
                None => return Ok(()),
                Some(b'{') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b'}') => {
                    depth -= 1;
                    self.pos += 1;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.block_comment()?,
                Some(quote @ (b'\'' | b'"')) => {
                    self.string_literal(quote)?;
                }
                Some(_) => self.pos += 1,
            }
        }

        Ok(())
    }

    fn record(&mut self, specifier: String, span: Span, line: usize, kind: ImportKind) {
        self.result.imports.push(ImportedModule {
            specifier,
            span,
            line,
            kind,
        });
    }
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte == b'$'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$'
}

/// Keywords after which `/` starts a regex rather than a division.
fn is_expression_keyword(word: &str) -> bool {
    matches!(
        word,
        "return" | "typeof" | "case" | "in" | "of" | "new" | "delete" | "void"
            | "instanceof" | "do" | "else" | "yield" | "await" | "throw"
    )
}

/// Parse `name="value"` out of a triple-slash directive body.
fn xml_attribute(text: &str, name: &str) -> Option<String> {
    let idx = text.find(&format!("{name}=\""))?;
    let rest = &text[idx + name.len() + 2..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// For each ignore mark, the first following line with any non-blank
/// content is suppressed.
fn suppressed_lines(source: &str, marks: &[usize]) -> Vec<usize> {
    let lines: Vec<&str> = source.lines().collect();

    marks
        .iter()
        .filter_map(|&mark| {
            lines
                .iter()
                .enumerate()
                .skip(mark)
                .find(|(_, line)| !line.trim().is_empty())
                .map(|(idx, _)| idx + 1)
        })
        .collect()
}
