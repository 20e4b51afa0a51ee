//! Redirection parsing: extracting `<`, `>`, `>>`, `2>` and `<<` from an
//! argument vector.
//!
//! The vector is rewritten in place: operator and operand tokens are removed
//! and the surviving tokens keep their original relative order, so what is
//! left is the command and its real arguments. The extracted filenames are
//! returned out of band.

use thiserror::Error;

/// Redirection targets extracted from one statement.
///
/// At most one filename per field. Truncating and appending output are
/// mutually exclusive, as are file input and heredoc input: assigning one
/// member of a pair clears the other, so the later operator on the line wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirections {
    /// `< file`: read standard input from a file.
    pub input: Option<String>,
    /// `> file`: write standard output, truncating.
    pub output: Option<String>,
    /// `>> file`: write standard output, appending.
    pub append: Option<String>,
    /// `2> file`: write standard error, truncating.
    pub error: Option<String>,
    /// `<< TOKEN`: read standard input from inline text up to `TOKEN`.
    pub heredoc: Option<String>,
}

impl Redirections {
    /// True when the statement carries no redirection at all.
    pub fn is_empty(&self) -> bool {
        self.input.is_none()
            && self.output.is_none()
            && self.append.is_none()
            && self.error.is_none()
            && self.heredoc.is_none()
    }
}

/// Errors detected while extracting redirections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedirectionError {
    /// A redirection operator was the last token of the statement.
    #[error("syntax error in redirection: '{0}' requires an operand")]
    MissingOperand(String),
}

/// Extract every redirection operator and its operand from `argv`, in place.
///
/// Scanning restarts at the same index after a removal, so adjacent
/// redirections (`cmd > a 2> b`) are handled in one pass. A missing operand
/// aborts the whole statement: the error is returned before any descriptor
/// is touched, and the caller must not execute the statement.
pub fn parse_redirections(argv: &mut Vec<String>) -> Result<Redirections, RedirectionError> {
    let mut redir = Redirections::default();

    let mut i = 0;
    while i < argv.len() {
        let op = argv[i].as_str();
        let is_op = matches!(op, "<" | ">" | ">>" | "2>" | "<<");
        if !is_op {
            i += 1;
            continue;
        }
        if i + 1 >= argv.len() {
            return Err(RedirectionError::MissingOperand(argv[i].clone()));
        }
        let operand = argv[i + 1].clone();
        match op {
            "<" => {
                redir.input = Some(operand);
                redir.heredoc = None;
            }
            "<<" => {
                redir.heredoc = Some(operand);
                redir.input = None;
            }
            ">" => {
                redir.output = Some(operand);
                redir.append = None;
            }
            ">>" => {
                redir.append = Some(operand);
                redir.output = None;
            }
            "2>" => redir.error = Some(operand),
            _ => unreachable!(),
        }
        // Remove operator and operand; the tail shifts left by two and the
        // scan resumes at the same index.
        argv.drain(i..i + 2);
    }

    Ok(redir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_output_redirection_extracted_in_place() {
        let mut v = argv(&["cmd", "a", ">", "out.txt", "b"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.output.as_deref(), Some("out.txt"));
        assert_eq!(v, argv(&["cmd", "a", "b"]));
    }

    #[test]
    fn test_all_five_operators() {
        let mut v = argv(&[
            "cmd", "<", "in", ">", "out", "2>", "err", "x",
        ]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.input.as_deref(), Some("in"));
        assert_eq!(redir.output.as_deref(), Some("out"));
        assert_eq!(redir.error.as_deref(), Some("err"));
        assert_eq!(v, argv(&["cmd", "x"]));
    }

    #[test]
    fn test_truncate_and_append_are_exclusive() {
        let mut v = argv(&["cmd", ">", "a", ">>", "b"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.output, None);
        assert_eq!(redir.append.as_deref(), Some("b"));

        let mut v = argv(&["cmd", ">>", "a", ">", "b"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.append, None);
        assert_eq!(redir.output.as_deref(), Some("b"));
    }

    #[test]
    fn test_file_input_and_heredoc_are_exclusive() {
        let mut v = argv(&["cmd", "<", "f", "<<", "EOF"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.input, None);
        assert_eq!(redir.heredoc.as_deref(), Some("EOF"));

        let mut v = argv(&["cmd", "<<", "EOF", "<", "f"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.heredoc, None);
        assert_eq!(redir.input.as_deref(), Some("f"));
    }

    #[test]
    fn test_missing_operand_is_syntax_error() {
        let mut v = argv(&["cmd", "a", ">"]);
        let err = parse_redirections(&mut v).unwrap_err();
        assert_eq!(err, RedirectionError::MissingOperand(">".to_string()));
    }

    #[test]
    fn test_no_redirections_leaves_argv_untouched() {
        let mut v = argv(&["echo", "a", "b"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert!(redir.is_empty());
        assert_eq!(v, argv(&["echo", "a", "b"]));
    }

    #[test]
    fn test_adjacent_operators_rescanned_at_same_index() {
        let mut v = argv(&["cmd", ">", "o", "<", "i"]);
        let redir = parse_redirections(&mut v).unwrap();
        assert_eq!(redir.output.as_deref(), Some("o"));
        assert_eq!(redir.input.as_deref(), Some("i"));
        assert_eq!(v, argv(&["cmd"]));
    }
}
