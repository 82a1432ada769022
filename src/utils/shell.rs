//! Quoting for command lines handed to `sh -c`.

const NEEDS_QUOTING: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}', '<',
    '>', '|', '&', ';', '#', '~',
];

/// Wrap in single quotes; an embedded `'` becomes `'\''`.
fn single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote one argument, leaving plain words (`run`, `2/8`, `--force`) bare.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(NEEDS_QUOTING) {
        single_quoted(arg)
    } else {
        arg.to_string()
    }
}

pub fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Paths are always quoted.
pub fn quote_path(path: &str) -> String {
    single_quoted(path)
}
