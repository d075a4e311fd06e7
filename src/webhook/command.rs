use crate::errors::CommandError;
use crate::model;
use crate::prelude::*;

/// The parsed body of a `/bisect` comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectCommand {
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
}

/// Returns `Ok(None)` for a comment that does not start with `/bisect` at
/// all (nothing to do, not an error); `Err` for one that does but is
/// malformed or fails validation.
pub fn parse(body: &str) -> Result<Option<BisectCommand>, CommandError> {
    let line = body
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("/bisect"));
    let Some(line) = line else {
        return Ok(None);
    };

    let rest = line["/bisect".len()..].trim_start();
    let mut parts = rest.splitn(3, char::is_whitespace);
    let good_sha = parts.next().filter(|s| !s.is_empty()).ok_or(CommandError::Malformed)?;
    let bad_sha = parts.next().filter(|s| !s.is_empty()).ok_or(CommandError::Malformed)?;
    let test_command = parts.next().unwrap_or("").trim();

    model::validate_sha(good_sha)?;
    model::validate_sha(bad_sha)?;
    model::validate_test_command(test_command)?;

    Ok(Some(BisectCommand {
        good_sha: good_sha.to_string(),
        bad_sha: bad_sha.to_string(),
        test_command: test_command.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_comments_without_the_command() {
        assert_eq!(parse("just chatting").unwrap(), None);
    }

    #[test]
    fn parses_a_well_formed_command() {
        let cmd = parse("/bisect abc1234 def5678 cargo test --release")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.good_sha, "abc1234");
        assert_eq!(cmd.bad_sha, "def5678");
        assert_eq!(cmd.test_command, "cargo test --release");
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(matches!(parse("/bisect abc1234"), Err(CommandError::Malformed)));
    }

    #[test]
    fn rejects_invalid_shas() {
        assert!(matches!(
            parse("/bisect zz abc1234 pytest"),
            Err(CommandError::InvalidSha(_))
        ));
    }

    #[test]
    fn rejects_disallowed_test_commands() {
        assert!(matches!(
            parse("/bisect abc123 def4567 ;rm -rf / pytest"),
            Err(CommandError::DisallowedCommand(_))
        ));
    }

    #[test]
    fn finds_the_command_among_other_lines() {
        let cmd = parse("thanks for the report\n/bisect abc1234 def5678 pytest\ncc @someone")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.good_sha, "abc1234");
    }
}
