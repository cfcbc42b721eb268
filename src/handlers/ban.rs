//! `ban`, `ban.url`, `ban.list` and `ban.stats`.

use super::Handler;
use crate::ban::BanEngine;
use crate::error::{AdminError, AdminResult};
use std::fmt::Write;

/// `ban <field> <op> <arg> [&& <field> <op> <arg>]...`
pub struct BanHandler;

impl Handler for BanHandler {
    fn handle(&self, engine: &BanEngine, args: &[&str]) -> AdminResult {
        if args.len() < 3 || (args.len() - 3) % 4 != 0 {
            return Err(AdminError::WrongArgumentCount);
        }
        if let Some(sep) = args.iter().skip(3).step_by(4).find(|a| **a != "&&") {
            return Err(AdminError::ExpectedAnd(sep.to_string()));
        }

        let mut builder = engine.builder();
        for cond in args.chunks(4) {
            builder.add_test(cond[0], cond[1], cond[2])?;
        }
        engine.insert(builder)?;
        Ok(String::new())
    }
}

/// `ban.url <regex>`: shorthand for `ban req.url ~ <regex>`.
pub struct BanUrlHandler;

impl Handler for BanUrlHandler {
    fn handle(&self, engine: &BanEngine, args: &[&str]) -> AdminResult {
        engine.insert_conditions(&[("req.url", "~", args[0])])?;
        Ok(String::new())
    }
}

/// `ban.list`
pub struct BanListHandler;

impl Handler for BanListHandler {
    fn handle(&self, engine: &BanEngine, _args: &[&str]) -> AdminResult {
        let mut out = String::from("Present bans:\n");
        for row in engine.list_bans() {
            let _ = writeln!(
                out,
                "{:10.6} {:5}{}\t{}",
                row.age,
                row.refcount,
                if row.gone { "G" } else { " " },
                row.conditions
            );
        }
        Ok(out)
    }
}

/// `ban.stats`: ban counters in Prometheus text format.
pub struct BanStatsHandler;

impl Handler for BanStatsHandler {
    fn handle(&self, engine: &BanEngine, _args: &[&str]) -> AdminResult {
        Ok(engine.stats().gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BanError;

    #[test]
    fn ban_with_and() {
        let engine = BanEngine::new(true);
        BanHandler
            .handle(&engine, &["req.url", "~", "^/a", "&&", "obj.http.X", "==", "1"])
            .unwrap();
        let rows = engine.list_bans();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conditions, "req.url ~ ^/a && obj.http.X == 1");
    }

    #[test]
    fn ban_wrong_argument_count() {
        let engine = BanEngine::new(true);
        let err = BanHandler
            .handle(&engine, &["req.url", "~", "^/a", "&&", "obj.http.X"])
            .unwrap_err();
        assert!(matches!(err, AdminError::WrongArgumentCount));
        assert_eq!(err.to_string(), "Wrong number of arguments");
    }

    #[test]
    fn ban_bad_separator() {
        let engine = BanEngine::new(true);
        let err = BanHandler
            .handle(&engine, &["req.url", "~", "^/a", "||", "obj.http.X", "==", "1"])
            .unwrap_err();
        assert_eq!(err.to_string(), "Found \"||\" expected &&");
        assert!(engine.list_bans().is_empty());
    }

    #[test]
    fn ban_rejects_bad_pattern_without_inserting() {
        let engine = BanEngine::new(true);
        let err = BanHandler
            .handle(&engine, &["req.url", "==", "/a", "&&", "req.url", "~", "(x"])
            .unwrap_err();
        assert!(matches!(err, AdminError::Ban(BanError::PatternError(_))));
        assert!(engine.list_bans().is_empty());
    }

    #[test]
    fn ban_url_is_regex_on_url() {
        let engine = BanEngine::new(true);
        BanUrlHandler.handle(&engine, &[r"\.png$"]).unwrap();
        assert_eq!(engine.list_bans()[0].conditions, r"req.url ~ \.png$");
    }

    #[test]
    fn ban_list_marks_gone() {
        let engine = BanEngine::new(true);
        BanUrlHandler.handle(&engine, &["^/a"]).unwrap();
        BanUrlHandler.handle(&engine, &["^/a"]).unwrap();

        let out = BanListHandler.handle(&engine, &[]).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Present bans:");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("0 \treq.url ~ ^/a"));
        assert!(lines[2].ends_with("0G\treq.url ~ ^/a"));
    }

    #[test]
    fn empty_ban_list() {
        let out = BanListHandler.handle(&BanEngine::new(true), &[]).unwrap();
        assert_eq!(out, "Present bans:\n");
    }

    #[test]
    fn ban_after_shutdown_is_refused() {
        let engine = BanEngine::new(true);
        engine.shutdown();
        let err = BanUrlHandler.handle(&engine, &["^/a"]).unwrap_err();
        assert_eq!(err.to_string(), "Shutting down");
        assert_eq!(err.status().code(), 300);
    }

    #[test]
    fn stats_report_ban_counters() {
        let engine = BanEngine::new(true);
        BanUrlHandler.handle(&engine, &["^/a"]).unwrap();
        BanUrlHandler.handle(&engine, &["^/a"]).unwrap();
        let out = BanStatsHandler.handle(&engine, &[]).unwrap();
        assert!(out.contains("bans 3"), "{}", out);
        assert!(out.contains("bans_dups_total 1"), "{}", out);
    }
}
