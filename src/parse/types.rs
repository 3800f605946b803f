//! Types produced by the argument parser and consumed by the eval layer.

/// One option occurrence in an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOption {
    /// Canonical option name (`-w`, `-c`, `--lua-exec`), after alias mapping.
    pub name: String,
    /// The value this option consumed, if it takes one and one was present.
    pub value: Option<String>,
    /// Index of the token the option was spelled in.
    pub token_index: usize,
    /// Whether the option takes a value (per the program's value flags).
    pub takes_value: bool,
}

impl ParsedOption {
    /// A value-taking option that appeared without its value.
    pub fn is_bare(&self) -> bool {
        self.takes_value && self.value.is_none()
    }
}

/// A command line split into options and operands.
///
/// Built from an already-tokenized argument vector; no token is ever
/// re-split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// The program name as submitted.
    pub program: String,
    /// The submitted argument tokens, unchanged.
    pub tokens: Vec<String>,
    /// Options in the order they appeared.
    pub options: Vec<ParsedOption>,
    /// Non-option words (including everything after `--`).
    pub operands: Vec<String>,
    /// Abbreviated long options that match more than one known option.
    pub ambiguous: Vec<String>,
}

impl ParsedCommand {
    /// Raw argument tokens.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Check if an option (canonical name) appears anywhere.
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o.name == name)
    }

    /// All occurrences of an option, in order.
    pub fn occurrences<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a ParsedOption> + use<'a, 'n> {
        self.options.iter().filter(move |o| o.name == name)
    }

    /// Value of the first occurrence of an option.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        self.occurrences(name).find_map(|o| o.value.as_deref())
    }

    /// Check if any occurrence of an option is missing its value.
    pub fn is_bare(&self, name: &str) -> bool {
        self.occurrences(name).any(ParsedOption::is_bare)
    }

    /// Check if any raw token matches exactly.
    pub fn has_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// Non-option words.
    pub fn operands(&self) -> &[String] {
        &self.operands
    }

    /// Option tokens the parser could not resolve to a single option.
    pub fn ambiguous_options(&self) -> &[String] {
        &self.ambiguous
    }
}
