use std::collections::{BTreeMap, BTreeSet};

use super::types::{ParsedCommand, ParsedOption};

/// Per-program option syntax: which options take a value, and which
/// spellings are aliases of a canonical option.
///
/// Long options may be abbreviated to any unique prefix, as getopt_long and
/// iproute2 allow. Every long spelling the grammar has heard of (value
/// flags, aliases, and names added with [`with_long_options`]) is a
/// candidate for that prefix match.
///
/// [`with_long_options`]: OptionGrammar::with_long_options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionGrammar {
    value_flags: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
    long_options: BTreeSet<String>,
    single_dash_long: bool,
}

/// How a whole-token option spelling resolved against the known long options.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LongMatch {
    /// Exact spelling or a unique prefix of one.
    Known(String),
    /// A prefix of several options with different meanings.
    Ambiguous,
    Unknown,
}

impl OptionGrammar {
    pub fn new<I, S>(value_flags: I, aliases: BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            value_flags: value_flags.into_iter().map(Into::into).collect(),
            aliases,
            long_options: BTreeSet::new(),
            single_dash_long: false,
        }
    }

    /// Add long spellings that take no value but must still win prefix
    /// matches (`--listen`, or a forbidden `--exec`).
    pub fn with_long_options<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.long_options.extend(names.into_iter().map(Into::into));
        self
    }

    /// Read `-word` as one option instead of a cluster of `-w -o -r -d`.
    pub fn with_single_dash_long(mut self, enabled: bool) -> Self {
        self.single_dash_long = enabled;
        self
    }

    /// Map an option spelling to its canonical name.
    pub fn canonical(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn takes_value(&self, canonical: &str) -> bool {
        self.value_flags.contains(canonical)
    }

    /// Whole-token spellings that must not be split as a short-option cluster.
    fn knows(&self, spelling: &str) -> bool {
        self.value_flags.contains(spelling)
            || self.aliases.contains_key(spelling)
            || (self.single_dash_long && spelling.len() > 2)
    }

    fn is_long(&self, spelling: &str) -> bool {
        let dashes = if self.single_dash_long { "-" } else { "--" };
        spelling.starts_with(dashes) && spelling.len() > 2
    }

    /// iproute2 reads `--batch` as `-batch`.
    fn normalize<'t>(&self, token: &'t str) -> &'t str {
        match token.strip_prefix('-') {
            Some(rest) if self.single_dash_long && rest.starts_with('-') && rest.len() > 1 => rest,
            _ => token,
        }
    }

    fn long_spellings(&self) -> impl Iterator<Item = &str> {
        self.value_flags
            .iter()
            .chain(self.aliases.keys())
            .chain(self.aliases.values())
            .chain(&self.long_options)
            .map(String::as_str)
            .filter(|s| self.is_long(s))
    }

    fn resolve_long(&self, head: &str) -> LongMatch {
        if !self.is_long(head) {
            return LongMatch::Unknown;
        }
        if self.long_spellings().any(|s| s == head) {
            return LongMatch::Known(head.to_string());
        }
        let mut meanings = BTreeSet::new();
        let mut first = None;
        for spelling in self.long_spellings().filter(|s| s.starts_with(head)) {
            meanings.insert(self.canonical(spelling));
            first.get_or_insert(spelling);
        }
        match (meanings.len(), first) {
            (1, Some(spelling)) => LongMatch::Known(spelling.to_string()),
            (0, _) => LongMatch::Unknown,
            _ => LongMatch::Ambiguous,
        }
    }
}

/// The next token, if it can serve as an option value.
/// A following option (anything starting with `-` other than `-` itself)
/// leaves the current option bare.
fn next_value(args: &[String], i: usize) -> Option<&String> {
    args.get(i + 1)
        .filter(|next| next.as_str() == "-" || !next.starts_with('-'))
}

/// Split an argument vector into options and operands the way getopt would:
/// `--name=value`, `--name value`, `-xVALUE`, `-x VALUE`, clustered short
/// flags (`-nnvw file`), abbreviated long options (`--exe`), and `--`
/// ending option processing.
pub fn parse_arguments(program: &str, args: &[String], grammar: &OptionGrammar) -> ParsedCommand {
    let mut options = Vec::new();
    let mut operands = Vec::new();
    let mut ambiguous = Vec::new();
    let mut end_of_options = false;
    let mut i = 0;

    while i < args.len() {
        let tok = &args[i];

        if end_of_options || tok == "-" || !tok.starts_with('-') {
            operands.push(tok.clone());
            i += 1;
            continue;
        }
        if tok == "--" {
            end_of_options = true;
            i += 1;
            continue;
        }

        // Whole-token options: --long, --long=value, and known spellings like -netns
        let spelled = grammar.normalize(tok);
        let (head, inline) = match spelled.split_once('=') {
            Some((h, v)) if h.starts_with("--") || grammar.knows(h) => (h, Some(v)),
            _ => (spelled, None),
        };
        if head.starts_with("--") || grammar.knows(head) {
            let token_index = i;
            let name = match grammar.resolve_long(head) {
                LongMatch::Known(spelling) => grammar.canonical(&spelling),
                LongMatch::Ambiguous => {
                    ambiguous.push(tok.clone());
                    head.to_string()
                }
                LongMatch::Unknown => grammar.canonical(head),
            };
            let takes_value = grammar.takes_value(&name) || inline.is_some();
            let mut value = inline.map(String::from);
            if value.is_none()
                && takes_value
                && let Some(next) = next_value(args, i)
            {
                value = Some(next.clone());
                i += 1;
            }
            options.push(ParsedOption {
                name,
                value,
                token_index,
                takes_value,
            });
            i += 1;
            continue;
        }

        // Short-option cluster: -abc, -w/path, -nnw path
        let token_index = i;
        let body = &tok[1..];
        for (pos, ch) in body.char_indices() {
            let name = grammar.canonical(&format!("-{ch}"));
            if grammar.takes_value(&name) {
                let rest = &body[pos + ch.len_utf8()..];
                let value = if !rest.is_empty() {
                    Some(rest.to_string())
                } else if let Some(next) = next_value(args, i) {
                    i += 1;
                    Some(next.clone())
                } else {
                    None
                };
                options.push(ParsedOption {
                    name,
                    value,
                    token_index,
                    takes_value: true,
                });
                break;
            }
            options.push(ParsedOption {
                name,
                value: None,
                token_index,
                takes_value: false,
            });
        }
        i += 1;
    }

    ParsedCommand {
        program: program.to_string(),
        tokens: args.to_vec(),
        options,
        operands,
        ambiguous,
    }
}
