use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catalog entry used to prefill a room's buffer. The catalog itself is an
/// external collaborator; only this read surface is consumed here.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub id: String,
    pub title: String,
    pub description: String,
    pub template: String,
    pub language: String,
}

#[async_trait]
pub trait ExerciseCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Option<Exercise>;
}

/// In-memory catalog seeded with a handful of interview exercises.
pub struct BuiltinCatalog {
    exercises: HashMap<String, Exercise>,
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        let mut exercises = HashMap::new();
        for exercise in [
            Exercise {
                id: "two-sum".into(),
                title: "Two Sum".into(),
                description: "Return indices of the two numbers that add up to the target.".into(),
                template: "function twoSum(nums, target) {\n  // TODO\n}\n".into(),
                language: "javascript".into(),
            },
            Exercise {
                id: "fizzbuzz".into(),
                title: "FizzBuzz".into(),
                description: "Print 1..100, replacing multiples of 3 and 5 as usual.".into(),
                template: "function fizzBuzz() {\n  // TODO\n}\n".into(),
                language: "javascript".into(),
            },
            Exercise {
                id: "lru-cache".into(),
                title: "LRU Cache".into(),
                description: "Implement an LRU cache with O(1) get and put.".into(),
                template: "class LRUCache {\n  constructor(capacity) {\n  }\n}\n".into(),
                language: "javascript".into(),
            },
        ] {
            exercises.insert(exercise.id.clone(), exercise);
        }
        BuiltinCatalog { exercises }
    }
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExerciseCatalog for BuiltinCatalog {
    async fn get(&self, id: &str) -> Option<Exercise> {
        self.exercises.get(id).cloned()
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analysis service is not configured")]
    Unavailable,
    #[error("analysis request failed: {0}")]
    Request(String),
}

/// Out-of-band AI code analysis. Implementations must never be called while
/// holding room state; the server invokes them from a detached task.
#[async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn analyze(&self, code: &str, language: &str) -> Result<String, AnalysisError>;
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    code: &'a str,
    language: &'a str,
}

#[derive(Deserialize)]
struct AnalysisResponse {
    analysis: String,
}

/// Forwards analysis requests to an external HTTP endpoint.
pub struct HttpAnalyzer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAnalyzer {
    pub fn new(endpoint: String) -> Self {
        HttpAnalyzer {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CodeAnalyzer for HttpAnalyzer {
    async fn analyze(&self, code: &str, language: &str) -> Result<String, AnalysisError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AnalysisRequest { code, language })
            .send()
            .await
            .map_err(|e| AnalysisError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalysisError::Request(e.to_string()))?;

        let body: AnalysisResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Request(e.to_string()))?;
        Ok(body.analysis)
    }
}

/// Stand-in used when no analysis endpoint is configured.
pub struct NoAnalyzer;

#[async_trait]
impl CodeAnalyzer for NoAnalyzer {
    async fn analyze(&self, _code: &str, _language: &str) -> Result<String, AnalysisError> {
        Err(AnalysisError::Unavailable)
    }
}

/// Fire-and-forget event emission; implementations must be infallible from
/// the caller's point of view.
pub trait AnalyticsSink: Send + Sync {
    fn emit(&self, event: &str, properties: serde_json::Value);
}

/// Writes analytics events as structured log lines.
pub struct LogAnalytics;

impl AnalyticsSink for LogAnalytics {
    fn emit(&self, event: &str, properties: serde_json::Value) {
        info!(target: "analytics", "{} {}", event, properties);
    }
}
