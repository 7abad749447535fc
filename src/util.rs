/// Wrap a string in single quotes for safe interpolation into a remote shell
/// command line.
///
/// Embedded single quotes close the quoted segment, emit an escaped quote,
/// and reopen: `it's` becomes `'it'\''s'`.
pub(crate) fn shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Render a `KEY=VALUE` pair as a shell `export` statement with the value
/// escaped. Used when injecting an execution environment into a remote
/// command line.
pub(crate) fn export_statement(key: &str, value: &str) -> String {
    format!("export {}={}", key, shell_escape(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_plain_path() {
        assert_eq!(shell_escape("/srv/project"), "'/srv/project'");
    }

    #[test]
    fn escape_embedded_space() {
        assert_eq!(shell_escape("a b"), "'a b'");
    }

    #[test]
    fn escape_embedded_single_quote() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn escape_defangs_substitution() {
        assert_eq!(shell_escape("$(id)"), "'$(id)'");
        assert_eq!(shell_escape("`id`"), "'`id`'");
    }

    #[test]
    fn export_statement_escapes_value() {
        assert_eq!(
            export_statement("RAILS_ENV", "dev test"),
            "export RAILS_ENV='dev test'"
        );
    }
}
