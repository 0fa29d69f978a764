// ABOUTME: Strict loader for .env-style files injected into sandbox scripts
// ABOUTME: Accepts only [export ]NAME=VALUE assignments and rejects the whole file otherwise

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$")
        .expect("assignment pattern is a valid regex")
});

static NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("name pattern is a valid regex"));

/// Whether `name` is usable as a shell variable name
pub fn is_valid_name(name: &str) -> bool {
    NAME.is_match(name)
}

#[derive(Error, Debug)]
pub enum EnvFileError {
    #[error("Failed to read env file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid content in {path} at line {line}: '{content}'. Only environment variable assignments are allowed (e.g., VAR=value)")]
    InvalidLine {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Ordered, immutable set of environment variables.
///
/// Insertion order follows the file. A name assigned twice keeps its first
/// position and takes the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVarSet {
    entries: Vec<(String, String)>,
}

impl EnvVarSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Effective variables for one invocation: `extra` overrides existing
    /// names in place and appends new ones in its own order.
    pub fn merged_with<'a, I>(&self, extra: I) -> EnvVarSet
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut merged = self.clone();
        for (name, value) in extra {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    fn insert(&mut self, name: String, value: String) {
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
}

impl FromIterator<(String, String)> for EnvVarSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut set = EnvVarSet::new();
        for (name, value) in iter {
            set.insert(name, value);
        }
        set
    }
}

/// Load an env file. A missing file yields an empty set.
pub fn load(path: impl AsRef<Path>) -> Result<EnvVarSet, EnvFileError> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Env file {} not found, using empty environment", path.display());
            return Ok(EnvVarSet::new());
        }
        Err(source) => {
            return Err(EnvFileError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let vars = parse(&content).map_err(|(line, content)| EnvFileError::InvalidLine {
        path: path.to_path_buf(),
        line,
        content,
    })?;
    debug!("Loaded {} variables from {}", vars.len(), path.display());
    Ok(vars)
}

/// Parse env file content. On failure returns the 1-based line number and
/// the trimmed offending line.
pub fn parse(content: &str) -> Result<EnvVarSet, (usize, String)> {
    let mut vars = EnvVarSet::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let captures = ASSIGNMENT
            .captures(line)
            .ok_or_else(|| (index + 1, line.to_string()))?;
        let name = captures[1].to_string();
        let value = strip_quotes(captures[2].trim()).to_string();
        vars.insert(name, value);
    }

    Ok(vars)
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_env(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = load(dir.path().join("absent.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn test_loads_all_assignment_forms() {
        let file = write_env(
            "# comment\n\nPLAIN=value\nexport EXPORTED=yes\nDOUBLE=\"two words\"\nSINGLE='it is'\nEMPTY=\n",
        );
        let vars = load(file.path()).unwrap();

        assert_eq!(vars.len(), 5);
        assert_eq!(vars.get("PLAIN"), Some("value"));
        assert_eq!(vars.get("EXPORTED"), Some("yes"));
        assert_eq!(vars.get("DOUBLE"), Some("two words"));
        assert_eq!(vars.get("SINGLE"), Some("it is"));
        assert_eq!(vars.get("EMPTY"), Some(""));
    }

    #[test]
    fn test_preserves_file_order() {
        let vars = parse("B=2\nA=1\nC=3\n").unwrap();
        let names: Vec<&str> = vars.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_duplicate_name_keeps_position_takes_last_value() {
        let vars = parse("A=1\nB=2\nA=3\n").unwrap();
        let pairs: Vec<(&str, &str)> = vars.iter().collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn test_no_escape_processing_inside_quotes() {
        let vars = parse(r#"PATTERN="a\nb""#).unwrap();
        assert_eq!(vars.get("PATTERN"), Some(r"a\nb"));
    }

    #[test]
    fn test_mismatched_quotes_kept_verbatim() {
        let vars = parse("MIXED=\"abc'\nLONE=\"\n").unwrap();
        assert_eq!(vars.get("MIXED"), Some("\"abc'"));
        assert_eq!(vars.get("LONE"), Some("\""));
    }

    #[rstest]
    #[case("GOOD=1\nthis is not valid\n", 2, "this is not valid")]
    #[case("\n\n1BAD=x\n", 3, "1BAD=x")]
    #[case("A=1\nexport\n", 2, "export")]
    #[case("# ok\nKEY value\nALSO BAD\n", 2, "KEY value")]
    fn test_invalid_line_reports_first_offender(
        #[case] content: &str,
        #[case] line: usize,
        #[case] offending: &str,
    ) {
        let file = write_env(content);
        let err = load(file.path()).unwrap_err();
        match &err {
            EnvFileError::InvalidLine {
                line: l,
                content: c,
                ..
            } => {
                assert_eq!(*l, line);
                assert_eq!(c, offending);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains(&format!("line {line}")));
    }

    #[rstest]
    #[case("PATH", true)]
    #[case("_private1", true)]
    #[case("9LIVES", false)]
    #[case("WITH-DASH", false)]
    #[case("", false)]
    fn test_is_valid_name(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_valid_name(name), expected);
    }

    #[test]
    fn test_merged_with_overrides_and_appends() {
        let base = parse("A=1\nB=2\n").unwrap();
        let extra = std::collections::BTreeMap::from([
            ("B".to_string(), "20".to_string()),
            ("C".to_string(), "30".to_string()),
        ]);
        let merged = base.merged_with(&extra);
        let pairs: Vec<(&str, &str)> = merged.iter().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "20"), ("C", "30")]);
        assert_eq!(base.get("B"), Some("2"));
    }
}
