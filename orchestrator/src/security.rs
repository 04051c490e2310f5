//! Security & validation primitives (spec §4.1).
//!
//! Every string crossing the trust boundary — paths, feature ids, session
//! names, verification commands, worker output — passes through exactly one
//! of these functions before it touches state or a subprocess. All
//! validators are fail-closed: on doubt, reject.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, OrchestratorResult};

const ID_PATTERN_SOURCE: &str = r"^[a-zA-Z0-9_-]{1,64}$";

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(ID_PATTERN_SOURCE).unwrap());

/// Rejects non-absolute paths, `..` segments, and symlink escapes. Returns
/// the canonicalised path on success.
pub fn validate_project_dir(p: &Path) -> OrchestratorResult<PathBuf> {
    if !p.is_absolute() {
        return Err(OrchestratorError::invalid_input(format!(
            "project directory must be an absolute path: {}",
            p.display()
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(OrchestratorError::invalid_input(
            "project directory must not contain '..' segments",
        ));
    }
    let canonical = p.canonicalize().map_err(|e| {
        OrchestratorError::invalid_input(format!(
            "project directory does not exist or is unreadable: {} ({e})",
            p.display()
        ))
    })?;
    Ok(canonical)
}

/// Resolves `rel` against `project_dir` and ensures the real path stays
/// under `project_dir` — rejects `..` escapes and symlink escapes. File I/O
/// throughout the rest of the crate must go through this before touching
/// disk.
pub fn validate_relative_path(project_dir: &Path, rel: &Path) -> OrchestratorResult<PathBuf> {
    if rel.is_absolute() {
        return Err(OrchestratorError::invalid_input(format!(
            "expected a relative path, got {}",
            rel.display()
        )));
    }
    let joined = project_dir.join(rel);
    // The target may not exist yet (e.g. a file about to be created), so
    // canonicalise the parent directory and re-attach the final component.
    let (check_dir, filename) = match joined.file_name() {
        Some(name) => (
            joined
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| project_dir.to_path_buf()),
            Some(name.to_owned()),
        ),
        None => (joined.clone(), None),
    };
    let canonical_dir = if check_dir.exists() {
        check_dir
            .canonicalize()
            .map_err(|e| OrchestratorError::invalid_input(format!("unresolvable path: {e}")))?
    } else {
        return Err(OrchestratorError::invalid_input(format!(
            "parent directory does not exist: {}",
            check_dir.display()
        )));
    };
    let canonical_project = project_dir.canonicalize().map_err(|e| {
        OrchestratorError::invalid_input(format!("unresolvable project directory: {e}"))
    })?;
    if !canonical_dir.starts_with(&canonical_project) {
        return Err(OrchestratorError::invalid_input(
            "path escapes the project directory",
        ));
    }
    Ok(match filename {
        Some(name) => canonical_dir.join(name),
        None => canonical_dir,
    })
}

/// `^[a-zA-Z0-9_-]{1,64}$`, shared by feature ids and session names.
fn validate_identifier(kind: &str, s: &str) -> OrchestratorResult<()> {
    if !ID_PATTERN.is_match(s) {
        return Err(OrchestratorError::invalid_input(format!(
            "invalid {kind}: must match {ID_PATTERN_SOURCE}"
        )));
    }
    Ok(())
}

pub fn validate_feature_id(s: &str) -> OrchestratorResult<()> {
    validate_identifier("feature id", s)
}

pub fn validate_session_name(s: &str) -> OrchestratorResult<()> {
    validate_identifier("session name", s)
}

/// Maps any character outside `[A-Za-z0-9._-]` to `_`. Never a substitute
/// for validation at a trust boundary — only for deriving filesystem-safe
/// fragments from already-validated input.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Wraps `s` in single quotes, escaping embedded single quotes with
/// `'\''`. Used *only* when emitting a shell script (`init.sh`); never to
/// build a command string for process execution.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn escape_regex(s: &str) -> String {
    regex::escape(s)
}

/// Largest byte index `<= index` that lies on a UTF-8 char boundary of `s`.
/// Used instead of raw byte slicing wherever a truncation point is computed
/// from a byte count on text that may contain multibyte codepoints.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest byte index `>= index` that lies on a UTF-8 char boundary of `s`.
pub fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Heuristic ReDoS smell test. Rust's `regex` crate is already
/// backtracking-free and linear-time, so this is defense-in-depth rather
/// than a load-bearing mitigation (see SPEC_FULL.md §9); the length cap is
/// the part that actually matters here.
pub fn is_dangerous_regex_pattern(pattern: &str) -> bool {
    const MAX_PATTERN_LEN: usize = 512;
    if pattern.len() > MAX_PATTERN_LEN {
        return true;
    }
    let nested_quantifier = Regex::new(r"[*+]\s*[*+]").unwrap();
    nested_quantifier.is_match(pattern)
}

/// Compiles `pattern` if it passes the dangerous-pattern check, otherwise
/// falls back to a literal substring match.
pub fn safe_regex_test(pattern: &str, input: &str) -> bool {
    const MAX_INPUT_LEN: usize = 1_000_000;
    let bounded_input = if input.len() > MAX_INPUT_LEN {
        &input[..floor_char_boundary(input, MAX_INPUT_LEN)]
    } else {
        input
    };
    if is_dangerous_regex_pattern(pattern) {
        return bounded_input.contains(pattern);
    }
    match Regex::new(pattern) {
        Ok(re) => re.is_match(bounded_input),
        Err(_) => bounded_input.contains(pattern),
    }
}

/// Truncates, strips terminal control bytes, and replaces the real home
/// directory prefix with `~` (literal, not regex, replacement — the home
/// path itself is untrusted-adjacent and must never be interpreted as a
/// pattern).
pub fn sanitize_output(s: &str, max_len: usize) -> String {
    let stripped: String = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let redacted = if let Some(home) = dirs_home() {
        let home_str = home.to_string_lossy();
        if !home_str.is_empty() {
            stripped.replace(home_str.as_ref(), "~")
        } else {
            stripped
        }
    } else {
        stripped
    };
    if redacted.len() > max_len {
        let mut truncated = redacted[..floor_char_boundary(&redacted, max_len)].to_string();
        truncated.push_str("...[truncated]");
        truncated
    } else {
        redacted
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Anchored patterns matching the exhaustive set of verification-command
/// shapes this server will ever execute (spec §4.6.1). Matched against the
/// re-joined, whitespace-tokenized argv, never the raw string.
pub static ALLOWED_COMMAND_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^cargo (build|check|test)(\s+\S+)*$",
        r"^cargo fmt -- --check$",
        r"^cargo clippy(\s+\S+)*\s+--\s+-D warnings$",
        r"^npm (test|ci)$",
        r"^npm run build$",
        r"^pnpm (test|build)$",
        r"^pnpm run build$",
        r"^yarn (test|build)$",
        r"^pytest(\s+\S+)*$",
        r"^go (build|test|vet)(\s+\S+)*$",
        r"^git add -A$",
        r"^git commit(\s+\S+)*$",
        r"^git diff(\s+\S+)*$",
        r"^git status(\s+\S+)*$",
        r"^git log(\s+\S+)*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static allow-list pattern is valid"))
    .collect()
});

/// Tokenizes `command` shell-style (no glob/variable expansion) and checks
/// the reassembled, whitespace-joined argv against `ALLOWED_COMMAND_PATTERNS`.
/// Returns the parsed argv on success.
pub fn validate_allowed_command(command: &str) -> OrchestratorResult<Vec<String>> {
    let argv = shlex::split(command).ok_or_else(|| {
        OrchestratorError::CommandNotAllowed {
            command: command.to_string(),
        }
    })?;
    if argv.is_empty() {
        return Err(OrchestratorError::CommandNotAllowed {
            command: command.to_string(),
        });
    }
    let rejoined = argv.join(" ");
    let allowed = ALLOWED_COMMAND_PATTERNS
        .iter()
        .any(|re| re.is_match(&rejoined));
    if !allowed {
        return Err(OrchestratorError::CommandNotAllowed {
            command: command.to_string(),
        });
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_project_dir() {
        assert!(validate_project_dir(Path::new("relative/path")).is_err());
    }

    #[test]
    fn rejects_dotdot_in_project_dir() {
        assert!(validate_project_dir(Path::new("/tmp/../etc")).is_err());
    }

    #[test]
    fn accepts_valid_identifiers() {
        assert!(validate_feature_id("feat-1").is_ok());
        assert!(validate_session_name("cc-worker-feat-1-ab12cd34").is_ok());
    }

    #[test]
    fn rejects_identifiers_with_bad_characters() {
        assert!(validate_feature_id("feat/1").is_err());
        assert!(validate_feature_id("../etc").is_err());
        assert!(validate_feature_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn sanitize_identifier_maps_unsafe_chars() {
        assert_eq!(sanitize_identifier("feat/1..bad"), "feat_1__bad");
    }

    #[test]
    fn sanitize_output_truncates_and_strips_control_bytes() {
        let input = "hello\x07world";
        let out = sanitize_output(input, 100);
        assert_eq!(out, "helloworld");
        let long = "a".repeat(50);
        assert!(sanitize_output(&long, 10).starts_with("aaaaaaaaaa"));
    }

    #[test]
    fn dangerous_pattern_rejected_for_nested_quantifiers() {
        assert!(is_dangerous_regex_pattern("(a+)+"));
        assert!(!is_dangerous_regex_pattern("a+b*"));
    }

    #[test]
    fn sanitize_output_does_not_panic_on_multibyte_char_at_truncation_point() {
        // Each "é" is 2 bytes; a cut at byte 9 lands mid-codepoint.
        let input = "aaaaaaaaé".repeat(20);
        let out = sanitize_output(&input, 9);
        assert!(out.starts_with("aaaaaaaa"));
    }

    #[test]
    fn floor_and_ceil_char_boundary_never_panic_on_multibyte_input() {
        let s = "é".repeat(1000);
        for idx in 0..s.len() {
            let floor = floor_char_boundary(&s, idx);
            let ceil = ceil_char_boundary(&s, idx);
            assert!(s.is_char_boundary(floor));
            assert!(s.is_char_boundary(ceil));
            let _ = &s[..floor];
            let _ = &s[ceil..];
        }
    }

    #[test]
    fn safe_regex_test_falls_back_to_literal_match() {
        assert!(safe_regex_test("(a+)+", "aaaa"));
        assert!(!safe_regex_test("(a+)+", "bbbb"));
    }

    #[test]
    fn allow_list_admits_known_commands() {
        assert!(validate_allowed_command("cargo test").is_ok());
        assert!(validate_allowed_command("npm test").is_ok());
        assert!(validate_allowed_command("git commit -m 'msg'").is_ok());
    }

    #[test]
    fn allow_list_rejects_unknown_commands() {
        assert!(validate_allowed_command("rm -rf /").is_err());
        assert!(validate_allowed_command("curl http://evil").is_err());
    }
}
