use std::cmp::Ordering;

use crate::error::{QuarryError, Result};

/// Compare two dotted version strings (e.g. "1.2.0" vs "v1.3.0").
///
/// A leading `v` is ignored, missing components count as zero and any
/// pre-release suffix on a component is dropped ("1-rc.1" -> 1). Returns
/// `Ordering::Less` when `a < b`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        s.split('.')
            .map(|p| {
                let numeric: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                numeric.parse().unwrap_or(0)
            })
            .collect()
    };
    let (mut a, mut b) = (parse(a), parse(b));
    let len = a.len().max(b.len()).max(3);
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b)
}

/// Strip a leading `v` from a release tag ("v1.3.0" -> "1.3.0").
pub fn tag_to_version(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

/// Turn a GitHub repository URL into its `owner/repo` id.
///
/// Accepts `http(s)://`, optional `www.`, and a trailing slash.
pub fn github_repo_id(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let Some(path) = rest.strip_prefix("github.com/") else {
        return Err(QuarryError::InvalidRepository(url.to_string()));
    };

    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Ok(format!("{owner}/{repo}"))
        }
        _ => Err(QuarryError::InvalidRepository(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compare_basic() {
        assert_eq!(compare_versions("1.2.0", "1.3.0"), Ordering::Less);
        assert_eq!(compare_versions("1.3.0", "1.2.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.2.0", "1.2.0"), Ordering::Equal);
    }

    #[test]
    fn version_compare_with_v_prefix() {
        assert_eq!(compare_versions("v1.2.0", "1.3.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.0", "v1.2.0"), Ordering::Equal);
    }

    #[test]
    fn version_compare_uneven_lengths() {
        assert_eq!(compare_versions("1.46", "1.46.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.46.0.1", "1.46"), Ordering::Greater);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn repo_id_from_url() {
        assert_eq!(
            github_repo_id("https://github.com/owner/repo/").unwrap(),
            "owner/repo"
        );
        assert_eq!(
            github_repo_id("http://www.github.com/owner/repo").unwrap(),
            "owner/repo"
        );
        assert!(github_repo_id("https://gitlab.com/owner/repo").is_err());
        assert!(github_repo_id("https://github.com/owner").is_err());
    }
}
