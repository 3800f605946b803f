/// Split a single command line into program and arguments using shlex
/// (POSIX word splitting).
///
/// Only used at the CLI boundary (`--line`); the gateway itself always
/// receives an already-tokenized argument vector. Unbalanced quotes are
/// rejected rather than guessed at.
pub fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut words = shlex::split(line)?;
    if words.is_empty() {
        return None;
    }
    let program = words.remove(0);
    Some((program, words))
}

/// Render a program and its arguments as a copy-pasteable shell line,
/// for diagnostics only.
pub fn display_command(program: &str, args: &[String]) -> String {
    let words = std::iter::once(program).chain(args.iter().map(String::as_str));
    shlex::try_join(words).unwrap_or_else(|_| {
        // Nul bytes cannot be quoted; fall back to plain joining
        std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    })
}
