// Error system for the Skizo runtime core
// Compile-phase diagnostics with spans plus the runtime abort codes shared
// with emitted C code.

use colored::Colorize;
use std::fmt;

pub mod abort;
pub use abort::AbortCode;

/// Source code location (line, column, file)
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub length: usize,
}

impl Span {
    pub fn new(file: String, line: usize, column: usize, length: usize) -> Self {
        Self {
            file,
            line,
            column,
            length,
        }
    }

    pub fn from_file_and_span(file: &str, source: &str, span: std::ops::Range<usize>) -> Self {
        let before = &source[..span.start.min(source.len())];
        let line = before.chars().filter(|&c| c == '\n').count() + 1;
        let column = before
            .rfind('\n')
            .map_or(before.len() + 1, |pos| before.len() - pos);
        let length = span.end.saturating_sub(span.start).max(1);

        Self {
            file: file.to_string(),
            line,
            column,
            length,
        }
    }

    pub fn unknown() -> Self {
        Self {
            file: "<unknown>".to_string(),
            line: 0,
            column: 0,
            length: 0,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Diagnostic severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    Error,
    Warning,
    Note,
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorLevel::Error => write!(f, "{}", "error".red().bold()),
            ErrorLevel::Warning => write!(f, "{}", "warning".yellow().bold()),
            ErrorLevel::Note => write!(f, "{}", "note".cyan().bold()),
        }
    }
}

/// Structured diagnostic message
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: ErrorLevel,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn new(level: ErrorLevel, message: String, span: Span) -> Self {
        Self {
            level,
            message,
            span,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn error(message: String, span: Span) -> Self {
        Self::new(ErrorLevel::Error, message, span)
    }

    pub fn warning(message: String, span: Span) -> Self {
        Self::new(ErrorLevel::Warning, message, span)
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", self.level, self.message.bold())?;
        writeln!(f, " {} {}", "-->".cyan().bold(), self.span)?;
        for note in &self.notes {
            writeln!(f, " {} {}", "=".cyan().bold(), note.cyan())?;
        }
        if let Some(help) = &self.help {
            writeln!(f, " {} {}", "help:".green().bold(), help)?;
        }
        Ok(())
    }
}

/// Diagnostic collection and reporting engine
#[derive(Debug, Default)]
pub struct DiagnosticEngine {
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
    warning_count: usize,
}

impl DiagnosticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, diagnostic: Diagnostic) {
        match diagnostic.level {
            ErrorLevel::Error => self.error_count += 1,
            ErrorLevel::Warning => self.warning_count += 1,
            _ => {}
        }
        self.diagnostics.push(diagnostic);
    }

    pub fn emit_error(&mut self, message: String, span: Span) {
        self.emit(Diagnostic::error(message, span));
    }

    pub fn emit_warning(&mut self, message: String, span: Span) {
        self.emit(Diagnostic::warning(message, span));
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn print_all(&self) {
        for d in &self.diagnostics {
            eprint!("{}", d);
        }
    }
}

/// Finds the candidate closest to `name` for "did you mean" help lines.
/// Returns None when nothing is similar enough to be worth suggesting.
pub fn closest_match<'a, I>(name: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(f64, &str)> = None;
    for candidate in candidates {
        let score = strsim::jaro_winkler(name, candidate);
        if score > best.map_or(0.0, |(s, _)| s) {
            best = Some((score, candidate));
        }
    }
    match best {
        Some((score, candidate)) if score >= 0.85 && candidate != name => {
            Some(candidate.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_from_offsets() {
        let source = "class A {\n  field x:int;\n}";
        let span = Span::from_file_and_span("a.skizo", source, 12..17);
        assert_eq!(span.line, 2);
        assert_eq!(span.column, 3);
        assert_eq!(span.length, 5);
    }

    #[test]
    fn test_engine_counts() {
        let mut engine = DiagnosticEngine::new();
        engine.emit_error("unresolved class 'Progam'".to_string(), Span::unknown());
        engine.emit_warning("unused local 'x'".to_string(), Span::unknown());
        assert!(engine.has_errors());
        assert_eq!(engine.error_count(), 1);
        assert_eq!(engine.warning_count(), 1);
    }

    #[test]
    fn test_closest_match() {
        let classes = ["Program", "Predicate", "Range"];
        assert_eq!(
            closest_match("Progam", classes.iter().copied()),
            Some("Program".to_string())
        );
        assert_eq!(closest_match("Zebra", classes.iter().copied()), None);
        // An exact match is not a suggestion.
        assert_eq!(closest_match("Range", classes.iter().copied()), None);
    }
}
