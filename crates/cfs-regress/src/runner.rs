//! Named suites of named cases with non-fatal assertions.
//!
//! A case keeps running after a failed check so one run reports every broken
//! behavior. A case that returns `Err` could not set itself up and counts as
//! failed as well.

use serde::Serialize;
use std::fmt::{self, Debug};

/// Assertion collector handed to each case.
#[derive(Debug, Default)]
pub struct Checks {
    run: usize,
    failures: Vec<String>,
}

impl Checks {
    pub fn check(&mut self, ok: bool, what: impl fmt::Display) -> bool {
        self.run += 1;
        if !ok {
            self.failures.push(what.to_string());
        }
        ok
    }

    pub fn check_eq<T: PartialEq + Debug>(&mut self, actual: T, expected: T, what: impl fmt::Display) -> bool {
        let ok = actual == expected;
        self.run += 1;
        if !ok {
            self.failures
                .push(format!("{}: expected {:?}, got {:?}", what, expected, actual));
        }
        ok
    }

    pub fn run(&self) -> usize {
        self.run
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

pub type CaseFn<C> = fn(&mut Checks, &C) -> anyhow::Result<()>;

pub struct Case<C> {
    pub name: &'static str,
    pub run: CaseFn<C>,
}

pub struct Suite<C> {
    pub name: &'static str,
    pub cases: Vec<Case<C>>,
}

impl<C> Suite<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cases: Vec::new(),
        }
    }

    pub fn case(mut self, name: &'static str, run: CaseFn<C>) -> Self {
        self.cases.push(Case { name, run });
        self
    }

    /// Run every case, or only those whose name contains `filter`.
    pub fn run(&self, ctx: &C, filter: Option<&str>, summary: &mut Summary) {
        let mut suite_failed = false;
        for case in &self.cases {
            if filter.is_some_and(|f| !case.name.contains(f)) {
                continue;
            }
            let mut checks = Checks::default();
            let result = (case.run)(&mut checks, ctx);
            let mut failures = checks.failures;
            if let Err(e) = result {
                failures.push(format!("case aborted: {:#}", e));
            }

            summary.tests_run += 1;
            summary.asserts_run += checks.run;
            summary.asserts_failed += failures.len();
            if failures.is_empty() {
                println!("  Test: {} ...passed", case.name);
            } else {
                println!("  Test: {} ...FAILED", case.name);
                summary.tests_failed += 1;
                suite_failed = true;
                for what in failures {
                    println!("    {}", what);
                    summary.failures.push(Failure {
                        suite: self.name.to_string(),
                        case: case.name.to_string(),
                        what,
                    });
                }
            }
        }
        summary.suites_run += 1;
        if suite_failed {
            summary.suites_failed += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub suite: String,
    pub case: String,
    pub what: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Summary {
    pub suites_run: usize,
    pub suites_failed: usize,
    pub tests_run: usize,
    pub tests_failed: usize,
    pub asserts_run: usize,
    pub asserts_failed: usize,
    pub failures: Vec<Failure>,
}

impl Summary {
    pub fn passed(&self) -> bool {
        self.tests_failed == 0 && self.asserts_failed == 0
    }

    /// 0 when everything passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run Summary:    Type  Total    Ran Passed Failed")?;
        writeln!(
            f,
            "              suites {:>6} {:>6}    n/a {:>6}",
            self.suites_run, self.suites_run, self.suites_failed
        )?;
        writeln!(
            f,
            "               tests {:>6} {:>6} {:>6} {:>6}",
            self.tests_run,
            self.tests_run,
            self.tests_run - self.tests_failed,
            self.tests_failed
        )?;
        write!(
            f,
            "             asserts {:>6} {:>6} {:>6} {:>6}",
            self.asserts_run,
            self.asserts_run,
            self.asserts_run.saturating_sub(self.asserts_failed),
            self.asserts_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing(c: &mut Checks, _: &()) -> anyhow::Result<()> {
        c.check(true, "always");
        c.check_eq(1 + 1, 2, "sum");
        Ok(())
    }

    fn failing(c: &mut Checks, _: &()) -> anyhow::Result<()> {
        c.check_eq(libc::ENOENT, libc::EACCES, "errno");
        c.check(true, "still runs");
        Ok(())
    }

    fn aborting(_: &mut Checks, _: &()) -> anyhow::Result<()> {
        anyhow::bail!("no temp dir")
    }

    #[test]
    fn test_summary_counts_and_exit_code() {
        let suite = Suite::new("s")
            .case("passing", passing)
            .case("failing", failing)
            .case("aborting", aborting);
        let mut summary = Summary::default();
        suite.run(&(), None, &mut summary);

        assert_eq!(summary.suites_run, 1);
        assert_eq!(summary.suites_failed, 1);
        assert_eq!((summary.tests_run, summary.tests_failed), (3, 2));
        assert_eq!((summary.asserts_run, summary.asserts_failed), (4, 2));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failures[0].case, "failing");
        assert!(summary.failures[0].what.contains("expected"));
        assert!(summary.failures[1].what.contains("no temp dir"));
    }

    #[test]
    fn test_filter_and_clean_run() {
        let suite = Suite::new("s").case("passing", passing).case("failing", failing);
        let mut summary = Summary::default();
        suite.run(&(), Some("pass"), &mut summary);
        assert!(summary.passed());
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.tests_run, 1);
        let text = summary.to_string();
        assert!(text.starts_with("Run Summary:"));
        assert!(text.contains("asserts"));
    }
}
