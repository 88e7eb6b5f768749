//! Verdict classification for judged and locally run submissions.

use serde::{Deserialize, Serialize};

use crate::problem::{ProblemKey, Submission};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pending,
    Accepted,
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    Failed,
}

impl Verdict {
    /// Map a raw judge verdict string. `None` and `TESTING` are still pending.
    pub fn from_judge(raw: Option<&str>) -> Verdict {
        match raw {
            None | Some("TESTING") | Some("") => Verdict::Pending,
            Some("OK") => Verdict::Accepted,
            Some("WRONG_ANSWER") => Verdict::WrongAnswer,
            Some("TIME_LIMIT_EXCEEDED") | Some("IDLENESS_LIMIT_EXCEEDED") => {
                Verdict::TimeLimitExceeded
            }
            Some("MEMORY_LIMIT_EXCEEDED") => Verdict::MemoryLimitExceeded,
            Some("RUNTIME_ERROR") => Verdict::RuntimeError,
            Some("COMPILATION_ERROR") => Verdict::CompilationError,
            Some(_) => Verdict::Failed,
        }
    }

    pub fn is_final(&self) -> bool {
        *self != Verdict::Pending
    }

    pub fn is_accepted(&self) -> bool {
        *self == Verdict::Accepted
    }
}

/// Newest submission for `problem` created strictly after `after` (unix seconds).
pub fn latest_after<'a>(
    history: &'a [Submission],
    problem: &ProblemKey,
    after: i64,
) -> Option<&'a Submission> {
    history
        .iter()
        .filter(|s| s.problem == *problem && s.created_at > after)
        .max_by_key(|s| (s.created_at, s.id))
}

/// The final verdict for the newest matching submission, if the judge has one yet.
pub fn resolve(history: &[Submission], problem: &ProblemKey, after: i64) -> Option<Verdict> {
    latest_after(history, problem, after)
        .map(|s| Verdict::from_judge(s.verdict.as_deref()))
        .filter(Verdict::is_final)
}

/// Output of one stage (compile or run) of a code-runner execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// What the code runner reports for one execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub compile: Option<StageOutput>,
    pub run: Option<StageOutput>,
}

/// Classify a local run against the expected output.
pub fn classify_run(report: &RunReport, expected: &str) -> Verdict {
    if let Some(compile) = &report.compile {
        if compile.code.is_some_and(|c| c != 0) || compile.signal.is_some() {
            return Verdict::CompilationError;
        }
    }

    let Some(run) = &report.run else {
        return Verdict::Failed;
    };

    match run.signal.as_deref() {
        Some("SIGKILL") | Some("SIGXCPU") => return Verdict::TimeLimitExceeded,
        Some(_) => return Verdict::RuntimeError,
        None => {}
    }
    if run.code.is_some_and(|c| c != 0) {
        return Verdict::RuntimeError;
    }

    if normalize(&run.stdout) == normalize(expected) {
        Verdict::Accepted
    } else {
        Verdict::WrongAnswer
    }
}

/// Trailing whitespace per line and trailing blank lines are not significant.
fn normalize(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}
