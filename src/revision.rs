//! Revision records and their binary serialisation.
//!
//! A [`Revision`] is one commit's worth of metadata plus its [`Diffstat`],
//! the per-file added/removed byte and line counters. Revisions are built
//! by a backend and treated as immutable afterwards; the cache persists
//! them with the fixed little-endian layout implemented here:
//!
//! ```text
//! Revision := id_string || u64 date || author_string || message_string || Diffstat
//! Diffstat := u32 n_entries || n_entries * (path_string || FileStat)
//! FileStat := u64 lines_added || u64 bytes_added || u64 lines_removed || u64 bytes_removed
//! string   := u32 length || length bytes
//! ```

use std::collections::BTreeMap;
use std::io::{self, Read};

use crate::wire;

/// Added/removed counters for a single file within one revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Bytes on added hunk lines.
    pub bytes_added: u64,
    /// Number of added hunk lines.
    pub lines_added: u64,
    /// Bytes on removed hunk lines.
    pub bytes_removed: u64,
    /// Number of removed hunk lines.
    pub lines_removed: u64,
}

impl FileStat {
    /// Returns true if every counter is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes_added == 0
            && self.lines_added == 0
            && self.bytes_removed == 0
            && self.lines_removed == 0
    }
}

/// Per-file change counters for one revision.
///
/// Entries for unchanged files are absent; all-zero entries are pruned on
/// construction. Iteration order is the path order, which keeps the
/// serialisation deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diffstat {
    files: BTreeMap<String, FileStat>,
}

impl Diffstat {
    /// An empty diffstat.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a diffstat from accumulated per-file counters, pruning
    /// all-zero entries.
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, FileStat>) -> Self {
        let files = entries.into_iter().filter(|(_, s)| !s.is_empty()).collect();
        Self { files }
    }

    /// Returns the counters for `path`, if the file changed.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileStat> {
        self.files.get(path)
    }

    /// Number of changed files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no files changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterates over `(path, counters)` in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileStat)> {
        self.files.iter().map(|(path, stat)| (path.as_str(), stat))
    }

    /// Appends the wire encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        wire::put_u32(out, self.files.len() as u32);
        for (path, stat) in &self.files {
            wire::put_string(out, path);
            wire::put_u64(out, stat.lines_added);
            wire::put_u64(out, stat.bytes_added);
            wire::put_u64(out, stat.lines_removed);
            wire::put_u64(out, stat.bytes_removed);
        }
    }

    /// Decodes a diffstat from its wire encoding.
    ///
    /// # Errors
    /// `UnexpectedEof` on truncation, `InvalidData` on malformed strings.
    pub fn decode(input: &mut impl Read) -> io::Result<Self> {
        let count = wire::read_u32(input)?;
        let mut files = BTreeMap::new();
        for _ in 0..count {
            let path = wire::read_string(input)?;
            let stat = FileStat {
                lines_added: wire::read_u64(input)?,
                bytes_added: wire::read_u64(input)?,
                lines_removed: wire::read_u64(input)?,
                bytes_removed: wire::read_u64(input)?,
            };
            files.insert(path, stat);
        }
        Ok(Self { files })
    }
}

/// One commit: identifier, metadata, and diffstat.
///
/// Immutable after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    id: String,
    date: i64,
    author: String,
    message: String,
    diffstat: Diffstat,
}

impl Revision {
    /// Builds a revision record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        date: i64,
        author: impl Into<String>,
        message: impl Into<String>,
        diffstat: Diffstat,
    ) -> Self {
        Self {
            id: id.into(),
            date,
            author: author.into(),
            message: message.into(),
            diffstat,
        }
    }

    /// The revision identifier, in bare or `PARENT:CHILD` form.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Commit timestamp in seconds: committer time plus the committer's
    /// timezone offset, i.e. a wall-clock value in the committer's local
    /// zone rather than pure UTC. Downstream reports rely on this.
    #[must_use]
    pub fn date(&self) -> i64 {
        self.date
    }

    /// Author name with the email address stripped.
    #[must_use]
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Full commit message, lines joined with `\n`.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Per-file change counters.
    #[must_use]
    pub fn diffstat(&self) -> &Diffstat {
        &self.diffstat
    }

    /// Consumes the revision, returning its diffstat.
    #[must_use]
    pub fn into_diffstat(self) -> Diffstat {
        self.diffstat
    }

    /// Serialises the revision into its wire encoding.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.message.len());
        wire::put_string(&mut out, &self.id);
        wire::put_u64(&mut out, self.date as u64);
        wire::put_string(&mut out, &self.author);
        wire::put_string(&mut out, &self.message);
        self.diffstat.encode_into(&mut out);
        out
    }

    /// Decodes a revision from its wire encoding.
    ///
    /// # Errors
    /// `UnexpectedEof` on truncation, `InvalidData` on malformed strings.
    pub fn decode(input: &mut impl Read) -> io::Result<Self> {
        let id = wire::read_string(input)?;
        let date = wire::read_u64(input)? as i64;
        let author = wire::read_string(input)?;
        let message = wire::read_string(input)?;
        let diffstat = Diffstat::decode(input)?;
        Ok(Self {
            id,
            date,
            author,
            message,
            diffstat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_diffstat() -> Diffstat {
        let mut entries = BTreeMap::new();
        entries.insert(
            "src/main.rs".to_string(),
            FileStat {
                bytes_added: 120,
                lines_added: 4,
                bytes_removed: 33,
                lines_removed: 1,
            },
        );
        entries.insert(
            "README".to_string(),
            FileStat {
                bytes_added: 10,
                lines_added: 1,
                ..FileStat::default()
            },
        );
        Diffstat::from_entries(entries)
    }

    #[test]
    fn zero_entries_are_pruned() {
        let mut entries = BTreeMap::new();
        entries.insert("unchanged".to_string(), FileStat::default());
        entries.insert(
            "changed".to_string(),
            FileStat {
                lines_added: 1,
                bytes_added: 5,
                ..FileStat::default()
            },
        );
        let stat = Diffstat::from_entries(entries);
        assert_eq!(stat.len(), 1);
        assert!(stat.get("unchanged").is_none());
    }

    #[test]
    fn revision_round_trips() {
        let rev = Revision::new(
            "parent123:child456",
            1_000_000_200,
            "Alice Smith",
            "first line\nsecond line",
            sample_diffstat(),
        );
        let bytes = rev.encode();
        let decoded = Revision::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, rev);
    }

    #[test]
    fn negative_date_survives_the_wire() {
        let rev = Revision::new("abc", -3600, "a", "m", Diffstat::new());
        let bytes = rev.encode();
        let decoded = Revision::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded.date(), -3600);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let rev = Revision::new("abc", 7, "a", "m", sample_diffstat());
        let mut bytes = rev.encode();
        bytes.truncate(bytes.len() / 2);
        assert!(Revision::decode(&mut bytes.as_slice()).is_err());
    }
}
