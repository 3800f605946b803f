pub mod args;
pub mod tokenize;
pub mod types;

pub use args::{OptionGrammar, parse_arguments};
pub use tokenize::{display_command, split_command_line};
pub use types::{ParsedCommand, ParsedOption};
