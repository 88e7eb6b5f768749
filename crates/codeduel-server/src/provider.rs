//! External collaborators: the problem corpus / judge listing and the code runner.

use std::collections::HashMap;

use async_trait::async_trait;
use codeduel_core::problem::{Problem, ProblemDetails, ProblemKind, Submission};
use codeduel_core::verdict::{RunReport, StageOutput};
use codeduel_core::ProblemKey;
use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, Result};

#[async_trait]
pub trait ProblemProvider: Send + Sync {
    /// The full problem set with per-problem solved counts.
    async fn corpus(&self) -> Result<Vec<Problem>>;

    /// Details of one problem. Fails with `NotFound` if the judge does not know it.
    async fn problem(&self, key: &ProblemKey) -> Result<ProblemDetails>;

    /// A player's submission history, newest first.
    async fn submissions(&self, handle: &str) -> Result<Vec<Submission>>;
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, language: &str, source: &str, stdin: &str) -> Result<RunReport>;
}

// ── Codeforces ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CfEnvelope<T> {
    status: String,
    comment: Option<String>,
    result: Option<T>,
}

impl<T> CfEnvelope<T> {
    fn into_result(self) -> Result<T> {
        match (self.status.as_str(), self.result) {
            ("OK", Some(result)) => Ok(result),
            _ => Err(ArenaError::ExternalProvider(
                self.comment.unwrap_or_else(|| "malformed judge response".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CfProblem {
    contest_id: Option<i64>,
    index: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    rating: Option<i32>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CfStatistic {
    contest_id: Option<i64>,
    index: String,
    solved_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CfProblemSet {
    problems: Vec<CfProblem>,
    problem_statistics: Vec<CfStatistic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CfSubmission {
    id: i64,
    creation_time_seconds: i64,
    problem: CfProblem,
    verdict: Option<String>,
}

/// Reads the Codeforces public API.
#[derive(Debug, Clone)]
pub struct CodeforcesClient {
    http: reqwest::Client,
    base_url: String,
}

impl CodeforcesClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let envelope: CfEnvelope<T> = self
            .http
            .get(format!("{}/{}", self.base_url, method))
            .query(query)
            .send()
            .await?
            .json()
            .await?;
        envelope.into_result()
    }
}

#[async_trait]
impl ProblemProvider for CodeforcesClient {
    async fn corpus(&self) -> Result<Vec<Problem>> {
        let set: CfProblemSet = self.get("problemset.problems", &[]).await?;

        let solved: HashMap<(i64, String), u32> = set
            .problem_statistics
            .into_iter()
            .filter_map(|s| Some(((s.contest_id?, s.index), s.solved_count)))
            .collect();

        Ok(set
            .problems
            .into_iter()
            .filter_map(|p| {
                let contest_id = p.contest_id?;
                let solved_count = solved
                    .get(&(contest_id, p.index.clone()))
                    .copied()
                    .unwrap_or(0);
                Some(Problem {
                    key: ProblemKey::new(contest_id, p.index),
                    name: p.name,
                    kind: if p.kind == "PROGRAMMING" {
                        ProblemKind::Programming
                    } else {
                        ProblemKind::Question
                    },
                    rating: p.rating,
                    tags: p.tags,
                    solved_count,
                })
            })
            .collect())
    }

    async fn problem(&self, key: &ProblemKey) -> Result<ProblemDetails> {
        let found = self
            .corpus()
            .await?
            .into_iter()
            .find(|p| p.key == *key)
            .ok_or_else(|| ArenaError::NotFound(format!("problem {key}")))?;

        Ok(ProblemDetails {
            name: found.name,
            rating: found.rating,
            tags: found.tags,
            ..ProblemDetails::default()
        })
    }

    async fn submissions(&self, handle: &str) -> Result<Vec<Submission>> {
        let subs: Vec<CfSubmission> = self.get("user.status", &[("handle", handle)]).await?;
        Ok(subs
            .into_iter()
            .filter_map(|s| {
                Some(Submission {
                    id: s.id,
                    problem: ProblemKey::new(s.problem.contest_id?, s.problem.index),
                    created_at: s.creation_time_seconds,
                    verdict: s.verdict,
                })
            })
            .collect())
    }
}

// ── Piston ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PistonFile<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct PistonRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<PistonFile<'a>>,
    stdin: &'a str,
}

#[derive(Debug, Deserialize)]
struct PistonStage {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    code: Option<i32>,
    signal: Option<String>,
}

impl From<PistonStage> for StageOutput {
    fn from(s: PistonStage) -> Self {
        StageOutput {
            stdout: s.stdout,
            stderr: s.stderr,
            code: s.code,
            signal: s.signal,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PistonResponse {
    compile: Option<PistonStage>,
    run: Option<PistonStage>,
    message: Option<String>,
}

/// Runs code on a Piston instance.
#[derive(Debug, Clone)]
pub struct PistonClient {
    http: reqwest::Client,
    base_url: String,
}

impl PistonClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CodeRunner for PistonClient {
    async fn run(&self, language: &str, source: &str, stdin: &str) -> Result<RunReport> {
        let body = PistonRequest {
            language,
            version: "*",
            files: vec![PistonFile { content: source }],
            stdin,
        };
        let resp: PistonResponse = self
            .http
            .post(format!("{}/execute", self.base_url))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if resp.run.is_none() && resp.compile.is_none() {
            return Err(ArenaError::ExternalProvider(
                resp.message.unwrap_or_else(|| "empty runner response".to_string()),
            ));
        }

        Ok(RunReport {
            compile: resp.compile.map(Into::into),
            run: resp.run.map(Into::into),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_failure_carries_comment() {
        let env: CfEnvelope<Vec<CfSubmission>> = serde_json::from_str(
            r#"{"status":"FAILED","comment":"handle: User with handle nobody not found"}"#,
        )
        .unwrap();
        let err = env.into_result().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn submission_wire_format() {
        let env: CfEnvelope<Vec<CfSubmission>> = serde_json::from_str(
            r#"{"status":"OK","result":[{"id":1,"contestId":4,"creationTimeSeconds":1700000000,
                "problem":{"contestId":4,"index":"A","name":"Watermelon","type":"PROGRAMMING",
                "rating":800,"tags":["math"]},"verdict":"OK"}]}"#,
        )
        .unwrap();
        let subs = env.into_result().unwrap();
        assert_eq!(subs[0].problem.contest_id, Some(4));
        assert_eq!(subs[0].verdict.as_deref(), Some("OK"));
    }
}
