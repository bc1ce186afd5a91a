//! Parse `.env` into key-value pairs (applied in lib with env-wins precedence).

use std::path::{Path, PathBuf};

/// Path of `.env` to read: `override_dir` if given, else the current directory.
fn env_file_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Parses one `KEY=VALUE` line. Returns `None` for blanks, comments, and lines
/// without `=`. An `export ` prefix is tolerated; surrounding single or double
/// quotes are stripped (double quotes support `\"`).
fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    };
    Some((key.to_string(), value))
}

/// Loads `.env` from `override_dir` or the current directory. Missing file
/// returns an empty list. Later lines win over earlier duplicates.
pub fn load_env_pairs(override_dir: Option<&Path>) -> std::io::Result<Vec<(String, String)>> {
    let Some(path) = env_file_path(override_dir) else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(&path)?;
    Ok(content.lines().filter_map(parse_line).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_pairs() {
        assert_eq!(
            parse_line("FOO=bar"),
            Some(("FOO".to_string(), "bar".to_string()))
        );
    }

    #[test]
    fn skips_comments_blanks_and_bare_words() {
        assert_eq!(parse_line("# a comment"), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("NOT_A_PAIR"), None);
        assert_eq!(parse_line("=no_key"), None);
    }

    #[test]
    fn strips_export_prefix_and_quotes() {
        assert_eq!(
            parse_line("export KEY=\"hello world\""),
            Some(("KEY".to_string(), "hello world".to_string()))
        );
        assert_eq!(
            parse_line("KEY='single'"),
            Some(("KEY".to_string(), "single".to_string()))
        );
        assert_eq!(
            parse_line(r#"KEY="say \"hi\"""#),
            Some(("KEY".to_string(), "say \"hi\"".to_string()))
        );
    }

    #[test]
    fn empty_value_is_kept() {
        assert_eq!(parse_line("KEY="), Some(("KEY".to_string(), String::new())));
    }

    #[test]
    fn missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_pairs(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn reads_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\n# skip\nB=2\n").unwrap();
        let pairs = load_env_pairs(Some(dir.path())).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
    }
}
