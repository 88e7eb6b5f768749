#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use codeduel_core::problem::{Problem, ProblemDetails, ProblemKind, Submission};
use codeduel_core::verdict::{RunReport, StageOutput};
use codeduel_core::ProblemKey;
use codeduel_server::config::Config;
use codeduel_server::error::{ArenaError, Result};
use codeduel_server::provider::{CodeRunner, ProblemProvider};
use codeduel_server::state::AppState;

/// Scripted judge: a fixed corpus and per-handle submission histories.
#[derive(Default)]
pub struct FakeJudge {
    corpus: Vec<Problem>,
    history: Mutex<HashMap<String, Vec<Submission>>>,
    next_id: Mutex<i64>,
}

impl FakeJudge {
    pub fn new(corpus: Vec<Problem>) -> Self {
        Self {
            corpus,
            ..Self::default()
        }
    }

    pub fn submit(&self, handle: &str, problem: ProblemKey, created_at: i64, verdict: Option<&str>) {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        self.history
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .or_default()
            .insert(
                0,
                Submission {
                    id: *next,
                    problem,
                    created_at,
                    verdict: verdict.map(str::to_string),
                },
            );
    }
}

#[async_trait]
impl ProblemProvider for FakeJudge {
    async fn corpus(&self) -> Result<Vec<Problem>> {
        Ok(self.corpus.clone())
    }

    async fn problem(&self, key: &ProblemKey) -> Result<ProblemDetails> {
        let p = self
            .corpus
            .iter()
            .find(|p| p.key == *key)
            .ok_or_else(|| ArenaError::NotFound(format!("problem {key}")))?;
        Ok(ProblemDetails {
            name: p.name.clone(),
            rating: p.rating,
            tags: p.tags.clone(),
            ..ProblemDetails::default()
        })
    }

    async fn submissions(&self, handle: &str) -> Result<Vec<Submission>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .unwrap_or_default())
    }
}

/// Echoes stdin back as program output.
pub struct EchoRunner;

#[async_trait]
impl CodeRunner for EchoRunner {
    async fn run(&self, _language: &str, _source: &str, stdin: &str) -> Result<RunReport> {
        Ok(RunReport {
            compile: None,
            run: Some(StageOutput {
                stdout: stdin.to_string(),
                stderr: String::new(),
                code: Some(0),
                signal: None,
            }),
        })
    }
}

pub fn problem(contest_id: i64, index: &str, rating: i32) -> Problem {
    Problem {
        key: ProblemKey::new(contest_id, index),
        name: format!("Problem {contest_id}{index}"),
        kind: ProblemKind::Programming,
        rating: Some(rating),
        tags: vec!["implementation".into()],
        solved_count: 1000,
    }
}

/// 1500A..1500C sit in the 1200 band, 1500D does not, 1500E is not a programming problem.
pub fn corpus() -> Vec<Problem> {
    let mut question = problem(1500, "E", 1200);
    question.kind = ProblemKind::Question;
    vec![
        problem(1500, "A", 1200),
        problem(1500, "B", 1100),
        problem(1500, "C", 1300),
        problem(1500, "D", 2000),
        question,
    ]
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub async fn state_with(config: Config, judge: Arc<FakeJudge>) -> Arc<AppState> {
    let (_app, state) = codeduel_server::build_app_with(config, judge, Arc::new(EchoRunner))
        .await
        .unwrap();
    state
}

pub async fn test_state(judge: Arc<FakeJudge>) -> Arc<AppState> {
    state_with(Config::for_tests(), judge).await
}
