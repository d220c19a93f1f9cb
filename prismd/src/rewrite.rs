use crate::request::RequestUrl;
use anyhow::{Context, Result};
use prism_core::config::RewriteRuleConfig;
use regex::Regex;

#[derive(Debug, Clone)]
struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

/// Ordered regex rewrite rules. The first rule that matches the path wins.
#[derive(Debug, Clone, Default)]
pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
}

impl RewriteEngine {
    pub fn new(rules: &[RewriteRuleConfig]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern)
                    .with_context(|| format!("invalid rewrite pattern '{}'", rule.pattern))?;
                Ok(RewriteRule {
                    pattern,
                    replacement: rule.replacement.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Rewrite `url` with the first matching rule.
    ///
    /// Capture groups are substituted into the replacement (`$1`, `${1}`).
    /// A `?` in the result splits off a query which is placed in front of the
    /// request's own query, joined with `&`.
    pub fn rewrite(&self, url: &RequestUrl) -> RequestUrl {
        let Some((rule, caps)) = self
            .rules
            .iter()
            .find_map(|rule| rule.pattern.captures(&url.path).map(|caps| (rule, caps)))
        else {
            return url.clone();
        };

        let mut expanded = String::new();
        caps.expand(&rule.replacement, &mut expanded);
        if !expanded.starts_with('/') {
            expanded.insert(0, '/');
        }

        let (path, query) = match expanded.split_once('?') {
            Some((path, extra)) => (path.to_string(), merge_query(extra, url.query.as_deref())),
            None => (expanded, url.query.clone()),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };

        tracing::debug!(
            pattern = %rule.pattern,
            from = %url,
            path = %path,
            query = query.as_deref().unwrap_or(""),
            "rewrote request url"
        );
        RequestUrl::new(path, query)
    }
}

fn merge_query(extra: &str, existing: Option<&str>) -> Option<String> {
    match existing.filter(|q| !q.is_empty()) {
        Some(existing) if extra.is_empty() => Some(existing.to_string()),
        Some(existing) => Some(format!("{extra}&{existing}")),
        None => (!extra.is_empty()).then(|| extra.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rules: &[(&str, &str)]) -> RewriteEngine {
        let rules: Vec<_> = rules
            .iter()
            .map(|(pattern, replacement)| RewriteRuleConfig {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            })
            .collect();
        RewriteEngine::new(&rules).unwrap()
    }

    #[test]
    fn substitutes_capture_groups() {
        let engine = engine(&[(r"^/blog/(\d+)/(\w+)$", "/blog.php?id=${1}&slug=$2")]);
        let out = engine.rewrite(&RequestUrl::new("/blog/42/hello", None));
        assert_eq!(out.path, "/blog.php");
        assert_eq!(out.query.as_deref(), Some("id=42&slug=hello"));
    }

    #[test]
    fn substitutes_named_groups() {
        let engine = engine(&[(r"^/tag/(?P<slug>[a-z]+)$", "/tags.php?slug=${slug}")]);
        let out = engine.rewrite(&RequestUrl::new("/tag/rust", None));
        assert_eq!(out.path, "/tags.php");
        assert_eq!(out.query.as_deref(), Some("slug=rust"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = engine(&[
            (r"^/docs/(.*)$", "/first/$1"),
            (r"^/docs/guide$", "/second"),
            (r"^/(.*)$", "/third/$1"),
        ]);
        let out = engine.rewrite(&RequestUrl::new("/docs/guide", None));
        assert_eq!(out.path, "/first/guide");

        let out = engine.rewrite(&RequestUrl::new("/other", None));
        assert_eq!(out.path, "/third/other");
    }

    #[test]
    fn rule_query_is_placed_before_existing_query() {
        let engine = engine(&[(r"^/p/(\d+)$", "/page.php?id=$1")]);
        let out = engine.rewrite(&RequestUrl::new("/p/7", Some("lang=en".into())));
        assert_eq!(out.query.as_deref(), Some("id=7&lang=en"));
    }

    #[test]
    fn existing_query_survives_rules_without_one() {
        let plain = engine(&[(r"^/old$", "/new")]);
        let out = plain.rewrite(&RequestUrl::new("/old", Some("x=1".into())));
        assert_eq!(out, RequestUrl::new("/new", Some("x=1".into())));

        let empty_query = engine(&[(r"^/old$", "/new?")]);
        let out = empty_query.rewrite(&RequestUrl::new("/old", Some("x=1".into())));
        assert_eq!(out.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn leading_separator_is_added() {
        let engine = engine(&[(r"^/short/(\w+)$", "long/$1"), (r"^/gone$", "")]);
        assert_eq!(
            engine.rewrite(&RequestUrl::new("/short/abc", None)).path,
            "/long/abc"
        );
        assert_eq!(engine.rewrite(&RequestUrl::new("/gone", None)).path, "/");
    }

    #[test]
    fn unmatched_url_is_unchanged() {
        let engine = engine(&[(r"^/blog/(\d+)$", "/blog.php?id=$1")]);
        let url = RequestUrl::new("/about", Some("a=b".into()));
        assert_eq!(engine.rewrite(&url), url);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let rules = vec![RewriteRuleConfig {
            pattern: "(".into(),
            replacement: "/".into(),
        }];
        assert!(RewriteEngine::new(&rules).is_err());
    }
}
