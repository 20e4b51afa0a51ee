//! Lexical analysis: splitting one raw input line into a statement.
//!
//! A statement is an argument vector plus the separator that ended it. One
//! input line may hold several statements chained with `;` or `&`; the
//! tokenizer consumes exactly one per call and reports the untouched tail so
//! the dispatch loop can carry it to the next iteration.

/// Separator that terminated a statement.
///
/// `&` is accepted syntactically but sequenced exactly like `;`: there is
/// no background execution on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// The statement ran to the end of the line (newline, comment, or end of
    /// buffer): nothing is left pending.
    None,
    /// `;`
    Sequence,
    /// `&`
    Background,
}

/// One parsed unit of work: an argument vector and its terminating separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub argv: Vec<String>,
    pub separator: Separator,
}

impl Statement {
    /// True when the statement carries no tokens at all (blank input).
    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }
}

/// Split the leading statement off `line`.
///
/// Returns the statement and, when the line was cut at an unquoted `;` or
/// `&`, the remaining suffix to be tokenized on a later call. The scan rules,
/// in priority order:
///
/// - `"` toggles the quoted state; the closing quote flushes the current
///   token, even an empty one. There is no escape mechanism: a quote always
///   closes a quoted region.
/// - Outside quotes, space and tab end the current token; inside quotes they
///   are ordinary content.
/// - Newline, end of buffer, or `#` ends the whole line. `#` truncates the
///   remainder as a comment. Neither leaves a pending suffix, and the quote
///   state does not protect against them.
/// - An unquoted `;` or `&` ends the statement and leaves everything after
///   it pending.
pub fn split_statement(line: &str) -> (Statement, Option<String>) {
    let mut argv = Vec::new();
    let mut separator = Separator::None;
    let mut pending = None;

    let mut token = String::new();
    let mut in_quote = false;

    let mut chars = line.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => {
                if in_quote {
                    // Closing quote: flush even an empty token.
                    argv.push(std::mem::take(&mut token));
                }
                in_quote = !in_quote;
            }
            ' ' | '\t' if !in_quote => {
                if !token.is_empty() {
                    argv.push(std::mem::take(&mut token));
                }
            }
            '\n' | '#' => {
                // End of line; `#` discards the rest as a comment.
                break;
            }
            ';' | '&' if !in_quote => {
                separator = if ch == ';' {
                    Separator::Sequence
                } else {
                    Separator::Background
                };
                let rest = &line[i + ch.len_utf8()..];
                if !rest.is_empty() {
                    pending = Some(rest.to_string());
                }
                break;
            }
            c => token.push(c),
        }
    }

    if !token.is_empty() {
        argv.push(token);
    }

    (Statement { argv, separator }, pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv_of(line: &str) -> Vec<String> {
        split_statement(line).0.argv
    }

    #[test]
    fn test_plain_words_split_on_blanks() {
        assert_eq!(argv_of("echo a  b\tc"), vec!["echo", "a", "b", "c"]);
    }

    #[test]
    fn test_quoted_space_stays_in_token() {
        assert_eq!(argv_of("echo \"a b\" c"), vec!["echo", "a b", "c"]);
    }

    #[test]
    fn test_closing_quote_flushes_even_empty() {
        assert_eq!(argv_of("echo \"\" x"), vec!["echo", "", "x"]);
    }

    #[test]
    fn test_quote_joins_with_open_token() {
        // The quote continues the token that was already open.
        assert_eq!(argv_of("echo a\"b c\"d"), vec!["echo", "ab c", "d"]);
    }

    #[test]
    fn test_semicolon_splits_statements() {
        let (first, rest) = split_statement("echo a; echo b");
        assert_eq!(first.argv, vec!["echo", "a"]);
        assert_eq!(first.separator, Separator::Sequence);

        let (second, rest2) = split_statement(&rest.unwrap());
        assert_eq!(second.argv, vec!["echo", "b"]);
        assert_eq!(second.separator, Separator::None);
        assert!(rest2.is_none());
    }

    #[test]
    fn test_ampersand_reported_but_pending_like_semicolon() {
        let (stmt, rest) = split_statement("sleepish &echo done");
        assert_eq!(stmt.argv, vec!["sleepish"]);
        assert_eq!(stmt.separator, Separator::Background);
        assert_eq!(rest.as_deref(), Some("echo done"));
    }

    #[test]
    fn test_quoted_separator_is_content() {
        let (stmt, rest) = split_statement("echo \"a;b\"");
        assert_eq!(stmt.argv, vec!["echo", "a;b"]);
        assert_eq!(stmt.separator, Separator::None);
        assert!(rest.is_none());
    }

    #[test]
    fn test_comment_truncates_line() {
        let (stmt, rest) = split_statement("echo hi# trailing; echo no");
        assert_eq!(stmt.argv, vec!["echo", "hi"]);
        assert_eq!(stmt.separator, Separator::None);
        assert!(rest.is_none());
    }

    #[test]
    fn test_newline_ends_line_without_pending() {
        let (stmt, rest) = split_statement("echo a\necho b");
        assert_eq!(stmt.argv, vec!["echo", "a"]);
        assert!(rest.is_none());
    }

    #[test]
    fn test_trailing_separator_leaves_no_pending() {
        let (stmt, rest) = split_statement("echo a;");
        assert_eq!(stmt.argv, vec!["echo", "a"]);
        assert_eq!(stmt.separator, Separator::Sequence);
        assert!(rest.is_none());
    }

    #[test]
    fn test_blank_line_is_empty_statement() {
        let (stmt, rest) = split_statement("   \t ");
        assert!(stmt.is_empty());
        assert_eq!(stmt.separator, Separator::None);
        assert!(rest.is_none());
    }
}
