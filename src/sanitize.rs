//! Cleanup of raw model output before it is treated as executable source.

use crate::error::GatewayError;

const FENCE: &str = "```";

/// Remove fenced-block markers and surrounding whitespace.
///
/// Any line whose trimmed content starts with a fence (with or without a
/// language tag) is dropped, and trailing fences glued to the last line
/// are stripped. Applying this twice yields the same text as applying it
/// once.
pub fn strip_fences(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with(FENCE))
        .collect();
    let mut text = kept.join("\n");

    loop {
        let len = text.trim_end().len();
        text.truncate(len);
        if !text.ends_with(FENCE) {
            break;
        }
        text.truncate(len - FENCE.len());
    }

    text.trim_start().to_string()
}

/// Split a dual-variant response into `(single, cluster)`.
///
/// The separator must occur exactly once and both sides must be non-empty
/// after fence stripping.
pub fn split_variants(raw: &str, separator: &str) -> Result<(String, String), GatewayError> {
    if separator.is_empty() {
        return Err(GatewayError::Partition(
            "separator token must not be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = raw.split(separator).collect();
    match parts.as_slice() {
        [single, cluster] => {
            let single = strip_fences(single);
            let cluster = strip_fences(cluster);
            if single.is_empty() || cluster.is_empty() {
                return Err(GatewayError::Partition(format!(
                    "separator '{separator}' produced an empty variant"
                )));
            }
            Ok((single, cluster))
        }
        [_] => Err(GatewayError::Partition(format!(
            "response does not contain separator '{separator}'"
        ))),
        _ => Err(GatewayError::Partition(format!(
            "separator '{separator}' occurs {} times (expected exactly once)",
            parts.len() - 1
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_language_tagged_fence() {
        let raw = "```python\nprint(1)\n```\n";
        assert_eq!(strip_fences(raw), "print(1)");
    }

    #[test]
    fn strips_trailing_glued_fence() {
        assert_eq!(strip_fences("x = 1\ny = 2```"), "x = 1\ny = 2");
        assert_eq!(strip_fences("x = 1``````  "), "x = 1");
    }

    #[test]
    fn leaves_plain_code_alone_except_outer_whitespace() {
        let raw = "\n\nimport sys\n\ndef f():\n    return 1\n\n";
        assert_eq!(strip_fences(raw), "import sys\n\ndef f():\n    return 1");
    }

    #[test]
    fn indented_fence_lines_are_dropped() {
        assert_eq!(strip_fences("   ```py\na\n  ```"), "a");
    }

    #[test]
    fn strip_is_idempotent() {
        let samples = [
            "",
            "```",
            "``````",
            "  ```python\n  print(1)\n```  ",
            "a```\n```b\nc```",
            "`` ```python`x",
            "\n\t```\n\n x\n",
            "no fences at all",
            "code``` ```",
        ];
        for s in samples {
            let once = strip_fences(s);
            let twice = strip_fences(&once);
            assert_eq!(once, twice, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn split_returns_both_sanitized_variants() {
        let raw = "```python\nprint('single')\n```\n###SPLIT###\n```python\nprint('cluster')\n```";
        let (single, cluster) = split_variants(raw, "###SPLIT###").unwrap();
        assert_eq!(single, "print('single')");
        assert_eq!(cluster, "print('cluster')");
    }

    #[test]
    fn split_without_separator_is_partition_error() {
        let err = split_variants("print(1)", "###SPLIT###").unwrap_err();
        assert!(matches!(err, GatewayError::Partition(_)), "{err}");
    }

    #[test]
    fn split_with_empty_side_is_partition_error() {
        let err = split_variants("print(1)\n###SPLIT###\n```\n```", "###SPLIT###").unwrap_err();
        assert!(matches!(err, GatewayError::Partition(_)), "{err}");
    }

    #[test]
    fn split_with_repeated_separator_is_partition_error() {
        let err = split_variants("a###SPLIT###b###SPLIT###c", "###SPLIT###").unwrap_err();
        assert!(err.to_string().contains("2 times"), "{err}");
    }
}
