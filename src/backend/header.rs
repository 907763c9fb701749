//! Parser for raw commit headers.
//!
//! The metadata pipeline feeds commits through `rev-list --header`, which
//! emits the raw commit object per revision:
//!
//! ```text
//! <hash>
//! tree <oid>
//! parent <oid>        (zero or more)
//! author NAME <EMAIL> TIMESTAMP TZ
//! committer NAME <EMAIL> TIMESTAMP TZ
//!
//!     message line    (four-character indent)
//! ```
//!
//! The parser extracts the author name, the committer date, and the
//! unindented message. The stored date is `committer_time + tz_offset`
//! with the timezone field read as a plain signed decimal (`+0200` → 200),
//! i.e. a wall-clock value in the committer's local zone. That value is
//! preserved verbatim because downstream reports depend on it.

use std::fmt;

/// Commit metadata extracted from a raw header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitMeta {
    /// Committer time plus timezone field, seconds.
    pub date: i64,
    /// Author name, email stripped.
    pub author: String,
    /// Commit message with the indent removed, lines joined by `\n`.
    pub message: String,
}

/// Errors from header parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum HeaderParseError {
    /// Header has fewer lines than any valid commit.
    TooShort { lines: usize },
    /// No `author ` line, or one with too few fields.
    MalformedAuthor,
    /// No `committer ` line, or one whose trailing fields are not a
    /// timestamp and timezone.
    MalformedDate,
}

impl fmt::Display for HeaderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { lines } => {
                write!(f, "header too short ({lines} lines)")
            }
            Self::MalformedAuthor => write!(f, "unable to parse author information"),
            Self::MalformedDate => write!(f, "unable to parse date information"),
        }
    }
}

impl std::error::Error for HeaderParseError {}

/// Parses a raw commit header into [`CommitMeta`].
///
/// # Errors
/// [`HeaderParseError`] if the author or committer lines are missing or
/// malformed.
pub fn parse_header<S: AsRef<str>>(lines: &[S]) -> Result<CommitMeta, HeaderParseError> {
    if lines.len() < 6 {
        return Err(HeaderParseError::TooShort { lines: lines.len() });
    }

    // Author: everything between "author " and the last '<'.
    let mut i = 0;
    while i < lines.len() && !lines[i].as_ref().starts_with("author ") {
        i += 1;
    }
    if i >= lines.len() {
        return Err(HeaderParseError::MalformedAuthor);
    }
    let fields: Vec<&str> = lines[i].as_ref().split(' ').collect();
    if fields.len() < 4 {
        return Err(HeaderParseError::MalformedAuthor);
    }
    let joined = fields[1..fields.len() - 2].join(" ");
    let author = match joined.rfind('<') {
        Some(pos) => joined[..pos].trim().to_string(),
        None => joined.trim().to_string(),
    };

    // Committer date: the last two fields are epoch seconds and a ±HHMM
    // timezone, read as a plain signed decimal and added on.
    while i < lines.len() && !lines[i].as_ref().starts_with("committer ") {
        i += 1;
    }
    if i >= lines.len() {
        return Err(HeaderParseError::MalformedDate);
    }
    let fields: Vec<&str> = lines[i].as_ref().split(' ').collect();
    if fields.len() < 2 {
        return Err(HeaderParseError::MalformedDate);
    }
    let seconds: i64 = fields[fields.len() - 2]
        .parse()
        .map_err(|_| HeaderParseError::MalformedDate)?;
    let offset: i64 = fields[fields.len() - 1]
        .parse()
        .map_err(|_| HeaderParseError::MalformedDate)?;
    let date = seconds + offset;

    // Message: after the first empty line, each line carries a
    // four-character indent.
    while i < lines.len() && !lines[i].as_ref().is_empty() {
        i += 1;
    }
    i += 1;
    let mut message = String::new();
    while i < lines.len() {
        message.push_str(lines[i].as_ref().get(4..).unwrap_or(""));
        if i < lines.len() - 1 {
            message.push('\n');
        }
        i += 1;
    }

    Ok(CommitMeta {
        date,
        author,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<&str> {
        raw.split('\n').collect()
    }

    #[test]
    fn parses_author_date_and_message() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             author Alice Smith <alice@x> 1000000000 +0200\n\
             committer Alice Smith <alice@x> 1000000000 +0200\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}first line\n\
             \u{20}\u{20}\u{20}\u{20}second line",
        );
        let meta = parse_header(&header).unwrap();
        assert_eq!(meta.author, "Alice Smith");
        assert_eq!(meta.date, 1_000_000_200);
        assert_eq!(meta.message, "first line\nsecond line");
    }

    #[test]
    fn negative_timezone_subtracts() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             author Bob <b@x> 500 -0100\n\
             committer Bob <b@x> 1000 -0100\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}msg",
        );
        let meta = parse_header(&header).unwrap();
        assert_eq!(meta.date, 900);
    }

    #[test]
    fn author_without_email_is_trimmed() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             author Solo 1 +0000\n\
             committer Solo <s@x> 1 +0000\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}msg",
        );
        let meta = parse_header(&header).unwrap();
        assert_eq!(meta.author, "Solo");
    }

    #[test]
    fn short_header_is_rejected() {
        let header = lines("tree abc\nauthor A <a@x> 1 +0000");
        assert!(matches!(
            parse_header(&header),
            Err(HeaderParseError::TooShort { .. })
        ));
    }

    #[test]
    fn missing_author_is_rejected() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             committer C <c@x> 1 +0000\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}msg\n\
             \u{20}\u{20}\u{20}\u{20}more",
        );
        assert!(matches!(
            parse_header(&header),
            Err(HeaderParseError::MalformedAuthor)
        ));
    }

    #[test]
    fn garbage_date_is_rejected() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             author A <a@x> 1 +0000\n\
             committer C <c@x> nonsense fields\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}msg",
        );
        assert!(matches!(
            parse_header(&header),
            Err(HeaderParseError::MalformedDate)
        ));
    }

    #[test]
    fn short_message_lines_contribute_only_breaks() {
        let header = lines(
            "tree abc\n\
             parent def\n\
             author A <a@x> 1 +0000\n\
             committer C <c@x> 1 +0000\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}one\n\
             \n\
             \u{20}\u{20}\u{20}\u{20}two",
        );
        let meta = parse_header(&header).unwrap();
        assert_eq!(meta.message, "one\n\ntwo");
    }
}
