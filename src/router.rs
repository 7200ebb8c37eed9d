//! The request-routing state machine (§4.6): an ordered list of route
//! rules, each a full-match regex plus an action, evaluated in order.

use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::manifest::RouteEntry;

/// One compiled route rule.
#[derive(Clone, Debug)]
pub struct RouteRule {
    pub src: Regex,
    pub dest: Option<String>,
    pub methods: Option<Vec<String>>,
    pub headers: Option<HashMap<String, String>>,
    pub status: Option<u16>,
    pub r#continue: bool,
    pub check: bool,
}

impl RouteRule {
    /// Compile a manifest-level route entry. `src` is anchored full-match,
    /// per §4.6.
    pub fn compile(entry: &RouteEntry) -> Result<Self> {
        let anchored = anchor(&entry.src);
        let src = Regex::new(&anchored)
            .with_context(|| format!("invalid route regex {:?}", entry.src))?;
        Ok(Self {
            src,
            dest: entry.dest.clone(),
            methods: entry.methods.clone(),
            headers: entry.headers.clone(),
            status: entry.status,
            r#continue: entry.r#continue,
            check: entry.check,
        })
    }
}

fn anchor(src: &str) -> String {
    let mut anchored = String::with_capacity(src.len() + 2);
    if !src.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(src);
    if !src.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

/// The outcome of evaluating a route list against one request.
#[derive(Clone, Debug, Default)]
pub struct RouteResult {
    pub found: bool,
    pub dest: Option<String>,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub uri_args: HashMap<String, String>,
}

/// A capability the router uses to decide `check: true` fallback rules:
/// "does a built asset exist for path P?"
pub trait AssetProbe {
    fn exists(&self, path: &str) -> bool;
}

/// Walk `rules` against `path`/`method`, per §4.6.
pub fn evaluate(rules: &[RouteRule], path: &str, method: &str, probe: &dyn AssetProbe) -> RouteResult {
    let mut result = RouteResult::default();

    for rule in rules {
        if let Some(methods) = &rule.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                continue;
            }
        }

        let Some(captures) = rule.src.captures(path) else {
            continue;
        };

        let dest = rule
            .dest
            .as_ref()
            .map(|template| expand(template, &captures));

        if rule.check {
            if let Some(dest) = &dest {
                let (dest_path, _) = split_query(dest);
                if !probe.exists(dest_path) {
                    continue;
                }
            }
        }

        if let Some(headers) = &rule.headers {
            for (key, template) in headers {
                result
                    .headers
                    .insert(key.clone(), expand(template, &captures));
            }
        }

        if let Some(status) = rule.status {
            result.status = Some(status);
        }

        result.found = true;

        if let Some(dest) = dest {
            let (dest_path, query) = split_query(&dest);
            result.dest = Some(dest_path.to_string());
            for (key, value) in query {
                result.uri_args.insert(key, value);
            }
        }

        if !rule.r#continue {
            return result;
        }
    }

    result
}

fn expand(template: &str, captures: &regex::Captures) -> String {
    let mut out = String::new();
    captures.expand(template, &mut out);
    out
}

/// Split `/path?a=b&c=d` into (`/path`, [(a,b), (c,d)]).
fn split_query(dest: &str) -> (&str, Vec<(String, String)>) {
    match dest.split_once('?') {
        None => (dest, Vec::new()),
        Some((path, query)) => {
            let pairs = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (path, pairs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysExists;
    impl AssetProbe for AlwaysExists {
        fn exists(&self, _path: &str) -> bool {
            true
        }
    }

    struct NeverExists;
    impl AssetProbe for NeverExists {
        fn exists(&self, _path: &str) -> bool {
            false
        }
    }

    fn rule(src: &str, dest: Option<&str>, status: Option<u16>) -> RouteRule {
        RouteRule::compile(&RouteEntry {
            src: src.to_string(),
            dest: dest.map(str::to_string),
            methods: None,
            headers: None,
            status,
            r#continue: false,
            check: false,
        })
        .unwrap()
    }

    #[test]
    fn first_match_wins_by_default() {
        let rules = vec![rule("^/old$", Some("/new"), Some(301)), rule("^/.*$", None, None)];
        let result = evaluate(&rules, "/old", "GET", &AlwaysExists);
        assert!(result.found);
        assert_eq!(result.status, Some(301));
        assert_eq!(result.dest.as_deref(), Some("/new"));
    }

    #[test]
    fn continue_merges_headers_and_keeps_evaluating() {
        let mut first = rule("^/.*$", None, None);
        first.r#continue = true;
        first.headers = Some(HashMap::from([("x-a".to_string(), "1".to_string())]));
        let mut second = rule("^/.*$", None, None);
        second.headers = Some(HashMap::from([("x-b".to_string(), "2".to_string())]));

        let result = evaluate(&[first, second], "/anything", "GET", &AlwaysExists);
        assert_eq!(result.headers.get("x-a").unwrap(), "1");
        assert_eq!(result.headers.get("x-b").unwrap(), "2");
    }

    #[test]
    fn check_true_requires_probe_to_confirm_existence() {
        let rules = vec![rule("^/(.*)$", Some("/static/$1"), None)];
        let mut checked = rules;
        checked[0].check = true;

        let miss = evaluate(&checked, "/a.png", "GET", &NeverExists);
        assert!(!miss.found);

        let hit = evaluate(&checked, "/a.png", "GET", &AlwaysExists);
        assert!(hit.found);
        assert_eq!(hit.dest.as_deref(), Some("/static/a.png"));
    }

    #[test]
    fn named_captures_substitute_into_dest() {
        let rules = vec![rule(r"^/user/(?P<id>\d+)$", Some("/profile?id=$id"), None)];
        let result = evaluate(&rules, "/user/42", "GET", &AlwaysExists);
        assert!(result.found);
        assert_eq!(result.dest.as_deref(), Some("/profile"));
        assert_eq!(result.uri_args.get("id").unwrap(), "42");
    }

    #[test]
    fn methods_filter_excludes_non_matching_requests() {
        let mut only_post = rule("^/submit$", Some("/handler"), None);
        only_post.methods = Some(vec!["POST".to_string()]);

        let get_result = evaluate(&[only_post.clone()], "/submit", "GET", &AlwaysExists);
        assert!(!get_result.found);

        let post_result = evaluate(&[only_post], "/submit", "POST", &AlwaysExists);
        assert!(post_result.found);
    }

    #[test]
    fn no_match_means_found_is_false() {
        let rules = vec![rule("^/only$", None, None)];
        let result = evaluate(&rules, "/nope", "GET", &AlwaysExists);
        assert!(!result.found);
    }
}
