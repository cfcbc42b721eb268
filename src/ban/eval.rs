//! Ban evaluation.
//!
//! Decides whether every condition of one ban holds for an object, given the
//! request that is looking the object up. The lurker evaluates without a
//! request, in which case any test reading request data makes the result
//! [`Verdict::Indeterminate`].

use super::pattern::PatternEngine;
use super::spec::{BanSpec, Operator, Subject};

/// Request-side data a ban can test.
pub trait RequestView {
    /// Request target, path plus query.
    fn url(&self) -> &str;
    /// Value of a request header; `None` when absent.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Object-side data a ban can test.
pub trait ObjectView {
    /// Value of a stored response header; `None` when absent.
    fn header(&self, name: &str) -> Option<&str>;
    /// Stored response status.
    fn status(&self) -> u16;
}

impl RequestView for http::request::Parts {
    fn url(&self) -> &str {
        self.uri.path_and_query().map_or("", |pq| pq.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl<B> RequestView for http::Request<B> {
    fn url(&self) -> &str {
        self.uri().path_and_query().map_or("", |pq| pq.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

/// Outcome of evaluating one ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every condition holds.
    Match,
    /// At least one condition is false.
    NoMatch,
    /// A condition needs the request and none was supplied.
    Indeterminate,
}

/// Evaluate `spec` against an object and, if available, the request.
///
/// Conditions are AND-ed and evaluated in order; the first failing one ends
/// the evaluation. `tests` is incremented once per condition examined.
pub fn evaluate(
    spec: &BanSpec,
    patterns: &dyn PatternEngine,
    obj: &dyn ObjectView,
    req: Option<&dyn RequestView>,
    tests: &mut u64,
) -> Verdict {
    for test in spec.tests() {
        *tests += 1;

        let status;
        let subject: Option<&str> = match (test.subject, req) {
            (Subject::RequestUrl, Some(req)) => Some(req.url()),
            (Subject::RequestHeader(name), Some(req)) => req.header(name),
            (Subject::RequestUrl | Subject::RequestHeader(_), None) => {
                return Verdict::Indeterminate;
            }
            (Subject::ObjectHeader(name), _) => obj.header(name),
            (Subject::ObjectStatus, _) => {
                status = obj.status().to_string();
                Some(status.as_str())
            }
        };

        let blob = test.pattern.unwrap_or_default();
        let holds = match test.operator {
            Operator::Equal => subject.is_some_and(|s| s == test.literal),
            Operator::NotEqual => subject.is_none_or(|s| s != test.literal),
            Operator::Match => subject.is_some_and(|s| patterns.matches(blob, s)),
            Operator::NotMatch => subject.is_none_or(|s| !patterns.matches(blob, s)),
        };
        if !holds {
            return Verdict::NoMatch;
        }
    }
    Verdict::Match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::pattern::{Diagnostic, RegexEngine};
    use crate::ban::spec::encode;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Obj {
        status: u16,
        headers: HashMap<&'static str, &'static str>,
    }

    impl ObjectView for Obj {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
        }

        fn status(&self) -> u16 {
            self.status
        }
    }

    fn obj(headers: &[(&'static str, &'static str)]) -> Obj {
        Obj {
            status: 200,
            headers: headers.iter().copied().collect(),
        }
    }

    fn req(url: &str, headers: &[(&str, &str)]) -> http::Request<()> {
        let mut b = http::Request::builder().uri(url);
        for (k, v) in headers {
            b = b.header(*k, *v);
        }
        b.body(()).unwrap()
    }

    fn eval(conditions: &[(&str, &str, &str)], o: &Obj, r: Option<&http::Request<()>>) -> Verdict {
        let engine = RegexEngine::new();
        let spec = encode(&engine, conditions).unwrap();
        let mut tests = 0;
        evaluate(&spec, &engine, o, r.map(|r| r as &dyn RequestView), &mut tests)
    }

    #[test]
    fn url_equality_and_pattern() {
        let o = obj(&[]);
        let r = req("/foo/bar?x=1", &[]);
        assert_eq!(eval(&[("req.url", "==", "/foo/bar?x=1")], &o, Some(&r)), Verdict::Match);
        assert_eq!(eval(&[("req.url", "==", "/foo")], &o, Some(&r)), Verdict::NoMatch);
        assert_eq!(eval(&[("req.url", "~", "^/foo")], &o, Some(&r)), Verdict::Match);
        assert_eq!(eval(&[("req.url", "!~", "^/foo")], &o, Some(&r)), Verdict::NoMatch);
        assert_eq!(eval(&[("req.url", "!=", "/baz")], &o, Some(&r)), Verdict::Match);
    }

    #[test]
    fn absent_header_semantics() {
        let o = obj(&[]);
        let r = req("/", &[]);
        assert_eq!(eval(&[("req.http.Cookie", "==", "x")], &o, Some(&r)), Verdict::NoMatch);
        assert_eq!(eval(&[("req.http.Cookie", "!=", "x")], &o, Some(&r)), Verdict::Match);
        assert_eq!(eval(&[("obj.http.Vary", "~", ".")], &o, Some(&r)), Verdict::NoMatch);
        assert_eq!(eval(&[("obj.http.Vary", "!~", ".")], &o, Some(&r)), Verdict::Match);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let o = obj(&[("content-type", "text/html")]);
        let r = req("/", &[("cookie", "x")]);
        assert_eq!(eval(&[("req.http.Cookie", "==", "x")], &o, Some(&r)), Verdict::Match);
        assert_eq!(
            eval(&[("obj.http.Content-Type", "~", "^text/")], &o, None),
            Verdict::Match
        );
    }

    #[test]
    fn object_status() {
        let mut o = obj(&[]);
        o.status = 404;
        assert_eq!(eval(&[("obj.status", "==", "404")], &o, None), Verdict::Match);
        assert_eq!(eval(&[("obj.status", "~", "^5")], &o, None), Verdict::NoMatch);
    }

    #[test]
    fn request_test_without_request_is_indeterminate() {
        let o = obj(&[]);
        assert_eq!(eval(&[("req.http.Cookie", "==", "x")], &o, None), Verdict::Indeterminate);
        assert_eq!(
            eval(&[("obj.http.X", "!=", "1"), ("req.url", "~", ".")], &o, None),
            Verdict::Indeterminate
        );
    }

    #[test]
    fn and_semantics() {
        let o = obj(&[("x-tag", "a")]);
        let r = req("/p", &[]);
        let both = [("req.url", "==", "/p"), ("obj.http.X-Tag", "==", "a")];
        assert_eq!(eval(&both, &o, Some(&r)), Verdict::Match);
        let second_fails = [("req.url", "==", "/p"), ("obj.http.X-Tag", "==", "b")];
        assert_eq!(eval(&second_fails, &o, Some(&r)), Verdict::NoMatch);
    }

    /// Counts pattern invocations so short-circuiting can be observed.
    struct CountingEngine {
        inner: RegexEngine,
        calls: AtomicUsize,
    }

    impl PatternEngine for CountingEngine {
        fn compile(&self, literal: &str) -> Result<Vec<u8>, Diagnostic> {
            self.inner.compile(literal)
        }

        fn matches(&self, blob: &[u8], subject: &str) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.inner.matches(blob, subject)
        }
    }

    #[test]
    fn first_failing_condition_short_circuits() {
        let engine = CountingEngine {
            inner: RegexEngine::new(),
            calls: AtomicUsize::new(0),
        };
        let spec = encode(
            &engine,
            &[("obj.status", "==", "500"), ("req.url", "~", "."), ("obj.http.X", "~", ".")],
        )
        .unwrap();

        let o = obj(&[("x", "1")]);
        let mut tests = 0;
        // No request: the cheap object test fails before the request test is reached.
        let verdict = evaluate(&spec, &engine, &o, None, &mut tests);
        assert_eq!(verdict, Verdict::NoMatch);
        assert_eq!(tests, 1);
        assert_eq!(engine.calls.load(Ordering::Relaxed), 0);
    }
}
