//! Pattern-based request multiplexer.
//!
//! Patterns look like `"GET /users/{id}"` or, without a method, `"/any"`.
//!
//! | pattern piece | meaning |
//! |---|---|
//! | `{name}` | one path segment, captured as `name` |
//! | `{name...}` | the rest of the path (last segment only) |
//! | trailing `/` or `/{$}` | exactly that path, trailing slash included |
//!
//! A `GET` pattern also serves `HEAD`. Method-less patterns serve every
//! method. Resolution tries the request's method first, then `GET` for
//! `HEAD`, then the method-less tree.
//!
//! Requests are matched segment by segment after percent-decoding, so
//! `/caf%C3%A9` hits a `/café` route and `{name}` captures `john doe` from
//! `john%20doe`. An encoded `%2F` never acts as a separator.
//!
//! Under the hood there is one [`matchit`] radix tree per method, so lookup
//! is O(path length). Conflicting or malformed patterns panic at
//! registration.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use http::Method;
use matchit::Router as MatchitRouter;
use percent_encoding::percent_decode_str;

use crate::context::Params;
use crate::handler::Chain;

/// The outcome of resolving a request against the mux.
pub(crate) enum Resolved {
    Found { chain: Chain, params: Params },
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

#[derive(Default)]
pub(crate) struct Mux {
    trees: HashMap<Method, MatchitRouter<Chain>>,
    any: MatchitRouter<Chain>,
}

struct Pattern {
    method: Option<Method>,
    path: String,
}

impl Mux {
    /// Registers `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or conflicts with an existing one.
    pub(crate) fn register(&mut self, pattern: &str, chain: Chain) {
        let parsed = parse(pattern).unwrap_or_else(|e| panic!("invalid pattern `{pattern}`: {e}"));
        let tree = match parsed.method {
            Some(method) => self.trees.entry(method).or_default(),
            None => &mut self.any,
        };
        tree.insert(parsed.path, chain)
            .unwrap_or_else(|e| panic!("pattern `{pattern}` conflicts with an existing route: {e}"));
    }

    /// Resolves a request for the still-encoded `raw_path`.
    pub(crate) fn resolve(&self, method: &Method, raw_path: &str) -> Resolved {
        let path = match_path(raw_path);
        if let Some(found) = self.find(method, &path) {
            return found;
        }

        let mut allowed: BTreeSet<&str> = BTreeSet::new();
        for (m, tree) in &self.trees {
            if tree.at(&path).is_ok() {
                allowed.insert(m.as_str());
                if *m == Method::GET {
                    allowed.insert(Method::HEAD.as_str());
                }
            }
        }
        if !allowed.is_empty() {
            let methods = allowed
                .into_iter()
                .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
                .collect();
            return Resolved::MethodNotAllowed(methods);
        }

        Resolved::NotFound
    }

    fn find(&self, method: &Method, path: &str) -> Option<Resolved> {
        let head_fallback = (*method == Method::HEAD).then(|| self.trees.get(&Method::GET)).flatten();
        let candidates = [self.trees.get(method), head_fallback, Some(&self.any)];

        candidates.into_iter().flatten().find_map(|tree| {
            let matched = tree.at(path).ok()?;
            let mut params = Params::default();
            for (k, v) in matched.params.iter() {
                params.push(k, percent_decode_str(v).decode_utf8_lossy());
            }
            Some(Resolved::Found { chain: matched.value.clone(), params })
        })
    }
}

/// Decodes every segment of `raw` on its own. A decoded `%` or `/` is
/// escaped again so it can neither start an escape nor split a segment;
/// captured values are decoded once more when they are handed out.
fn match_path(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') {
        return Cow::Borrowed(raw);
    }
    let segments: Vec<String> = raw
        .split('/')
        .map(|seg| percent_decode_str(seg).decode_utf8_lossy().replace('%', "%25").replace('/', "%2F"))
        .collect();
    Cow::Owned(segments.join("/"))
}

/// Splits `"METHOD /path"` and translates the path into matchit syntax.
fn parse(pattern: &str) -> Result<Pattern, String> {
    let pattern = pattern.trim();
    let (method, path) = match pattern.split_once([' ', '\t']) {
        Some((m, rest)) if !m.starts_with('/') => {
            let method = Method::from_bytes(m.as_bytes()).map_err(|_| format!("bad method `{m}`"))?;
            (Some(method), rest.trim_start())
        }
        _ => (None, pattern),
    };
    if !path.starts_with('/') {
        return Err("path must start with `/`".into());
    }

    let path = match path.strip_suffix("{$}") {
        Some(stripped) if stripped.ends_with('/') => stripped,
        Some(_) => return Err("`{$}` must follow a `/`".into()),
        None => path,
    };

    let segments: Vec<&str> = path.split('/').collect();
    let last = segments.len() - 1;
    let mut out = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        if seg.contains("{$}") {
            return Err("`{$}` is only allowed at the end".into());
        }
        match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) if name.ends_with("...") => {
                if i != last {
                    return Err("`{name...}` must be the last segment".into());
                }
                out.push(format!("{{*{}}}", name.trim_end_matches("...")));
            }
            Some("") => {
                return Err("wildcards need a name".into());
            }
            _ => out.push((*seg).to_owned()),
        }
    }

    Ok(Pattern { method, path: out.join("/") })
}

/// Lexical cleaning for request paths: collapses duplicate slashes,
/// resolves `.` and `..`, and keeps a trailing slash.
pub(crate) fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return "/".to_owned();
    }
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => { parts.pop(); }
            s => parts.push(s),
        }
    }
    let mut out = String::with_capacity(p.len() + 1);
    for seg in &parts {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() || (p.ends_with('/') && !parts.is_empty()) {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::Context;
    use crate::handler::HandlerFunc;

    fn chain() -> Chain {
        Arc::from(vec![HandlerFunc::from(|_: &mut Context| {})])
    }

    fn found(mux: &Mux, method: Method, path: &str) -> Option<Vec<(String, String)>> {
        match mux.resolve(&method, path) {
            Resolved::Found { params, .. } => {
                Some(params.iter().map(|p| (p.key.clone(), p.value.clone())).collect())
            }
            _ => None,
        }
    }

    #[test]
    fn method_patterns_and_params_in_declaration_order() {
        let mut mux = Mux::default();
        mux.register("GET /users/{id}/posts/{post}", chain());
        let params = found(&mux, Method::GET, "/users/7/posts/9").unwrap();
        assert_eq!(params, [("id".into(), "7".into()), ("post".into(), "9".into())]);
        assert!(found(&mux, Method::GET, "/users/7").is_none());
    }

    #[test]
    fn exact_marker_only_matches_the_slash_path() {
        let mut mux = Mux::default();
        mux.register("GET /docs/{$}", chain());
        assert!(found(&mux, Method::GET, "/docs/").is_some());
        assert!(found(&mux, Method::GET, "/docs/intro").is_none());
        assert!(matches!(mux.resolve(&Method::GET, "/docs"), Resolved::NotFound));
    }

    #[test]
    fn trailing_slash_without_marker_is_exact_too() {
        let mut mux = Mux::default();
        mux.register("/static/", chain());
        assert_eq!(found(&mux, Method::POST, "/static/"), Some(vec![]));
        assert!(found(&mux, Method::GET, "/static/css/site.css").is_none());
        assert!(matches!(mux.resolve(&Method::GET, "/static"), Resolved::NotFound));
    }

    #[test]
    fn captured_values_are_percent_decoded() {
        let mut mux = Mux::default();
        mux.register("GET /users/{name}", chain());
        let params = found(&mux, Method::GET, "/users/john%20doe").unwrap();
        assert_eq!(params, [("name".into(), "john doe".into())]);

        let params = found(&mux, Method::GET, "/users/100%25").unwrap();
        assert_eq!(params, [("name".into(), "100%".into())]);
    }

    #[test]
    fn encoded_static_segments_match_their_route() {
        let mut mux = Mux::default();
        mux.register("GET /café", chain());
        assert_eq!(found(&mux, Method::GET, "/caf%C3%A9"), Some(vec![]));
    }

    #[test]
    fn encoded_slash_stays_inside_its_segment() {
        let mut mux = Mux::default();
        mux.register("GET /files/{dir}/{name}", chain());
        mux.register("GET /raw/{path...}", chain());

        let params = found(&mux, Method::GET, "/files/a%2Fb/c.txt").unwrap();
        assert_eq!(params, [("dir".into(), "a/b".into()), ("name".into(), "c.txt".into())]);
        assert!(found(&mux, Method::GET, "/files/a%2Fb%2Fc.txt").is_none());

        let params = found(&mux, Method::GET, "/raw/x%20y/z%2Fw").unwrap();
        assert_eq!(params, [("path".into(), "x y/z/w".into())]);
    }

    #[test]
    fn rest_wildcard() {
        let mut mux = Mux::default();
        mux.register("GET /files/{path...}", chain());
        let params = found(&mux, Method::GET, "/files/a/b.txt").unwrap();
        assert_eq!(params, [("path".into(), "a/b.txt".into())]);
    }

    #[test]
    fn get_serves_head_and_other_methods_are_405() {
        let mut mux = Mux::default();
        mux.register("GET /hello", chain());
        mux.register("PUT /hello", chain());
        assert!(found(&mux, Method::HEAD, "/hello").is_some());
        match mux.resolve(&Method::DELETE, "/hello") {
            Resolved::MethodNotAllowed(allowed) => {
                assert_eq!(allowed, [Method::GET, Method::HEAD, Method::PUT]);
            }
            _ => panic!("expected 405"),
        }
    }

    #[test]
    fn method_less_patterns_serve_every_method() {
        let mut mux = Mux::default();
        mux.register("/any", chain());
        assert!(found(&mux, Method::PATCH, "/any").is_some());
        assert!(found(&mux, Method::GET, "/any").is_some());
    }

    #[test]
    fn misses_are_not_found() {
        let mut mux = Mux::default();
        mux.register("GET /2/3/hello", chain());
        assert!(matches!(mux.resolve(&Method::GET, "/2/hello"), Resolved::NotFound));
    }

    #[test]
    #[should_panic(expected = "conflicts")]
    fn duplicate_patterns_panic() {
        let mut mux = Mux::default();
        mux.register("GET /dup", chain());
        mux.register("GET /dup", chain());
    }

    #[test]
    #[should_panic(expected = "invalid pattern")]
    fn misplaced_rest_wildcard_panics() {
        Mux::default().register("GET /{rest...}/tail", chain());
    }

    #[test]
    #[should_panic(expected = "invalid pattern")]
    fn relative_paths_panic() {
        Mux::default().register("GET hello", chain());
    }

    #[test]
    fn clean_path_resolves_dots_and_slashes() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("//a//b"), "/a/b");
        assert_eq!(clean_path("/a/./b/../c/"), "/a/c/");
        assert_eq!(clean_path("/../a"), "/a");
        assert_eq!(clean_path("/a/.."), "/");
        assert_eq!(clean_path("a/b"), "/a/b");
    }
}
