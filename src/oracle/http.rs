//! HTTP 适配器：把外部 Oracle 服务接入 GenerationOracle / ScoringOracle / Implementer
//!
//! 请求体与响应体均为 JSON；响应体经多策略解析器解析，容忍服务端多包一层说明文字。
//! 网络错误与 5xx / 429 视为瞬时错误，由重试包装器处理。

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::core::EvolutionError;
use crate::llm::StructuredParser;
use crate::oracle::{
    DimensionScore, GenerationOracle, ImplementationReport, Implementer, ScoreCard, ScoringOracle,
    TestCase, ToolSpec,
};

async fn post_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    oracle: &str,
    url: &str,
    payload: &serde_json::Value,
) -> Result<T, EvolutionError> {
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| EvolutionError::transient(oracle, e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| EvolutionError::transient(oracle, e.to_string()))?;

    if !status.is_success() {
        let message = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(EvolutionError::transient(oracle, message));
        }
        return Err(EvolutionError::NotFound(format!("{oracle} rejected request: {message}")));
    }

    Ok(StructuredParser::default().parse(&body)?)
}

/// POST {instruction, input, case_id} → {"artifact": "..."}
pub struct HttpGenerationOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpGenerationOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct GenerationResponse {
    artifact: String,
}

#[async_trait]
impl GenerationOracle for HttpGenerationOracle {
    async fn generate(&self, instruction: &str, case: &TestCase) -> Result<String, EvolutionError> {
        let payload = serde_json::json!({
            "case_id": case.id,
            "instruction": instruction,
            "input": case.input,
        });
        let resp: GenerationResponse = post_json(&self.client, "generation", &self.url, &payload).await?;
        if resp.artifact.trim().is_empty() {
            return Err(EvolutionError::transient("generation", "empty artifact"));
        }
        Ok(resp.artifact)
    }
}

/// POST {artifact, reference} → {"scores": {dim: number|null}, "errors": {dim: msg}}
pub struct HttpScoringOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpScoringOracle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct ScoringResponse {
    #[serde(default)]
    scores: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    errors: BTreeMap<String, String>,
}

impl From<ScoringResponse> for ScoreCard {
    fn from(resp: ScoringResponse) -> Self {
        let mut dimensions: BTreeMap<String, DimensionScore> = resp
            .scores
            .into_iter()
            .map(|(k, v)| {
                let score = match v {
                    Some(s) => DimensionScore::Scored(s),
                    None => DimensionScore::Missing,
                };
                (k, score)
            })
            .collect();
        for (k, msg) in resp.errors {
            dimensions.insert(k, DimensionScore::Errored(msg));
        }
        ScoreCard { dimensions }
    }
}

#[async_trait]
impl ScoringOracle for HttpScoringOracle {
    async fn score(&self, artifact: &str, reference: Option<&str>) -> Result<ScoreCard, EvolutionError> {
        let payload = serde_json::json!({
            "artifact": artifact,
            "reference": reference,
        });
        let resp: ScoringResponse = post_json(&self.client, "scoring", &self.url, &payload).await?;
        Ok(resp.into())
    }
}

/// POST ToolSpec → ImplementationReport
pub struct HttpImplementer {
    client: reqwest::Client,
    url: String,
}

impl HttpImplementer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Implementer for HttpImplementer {
    async fn implement(&self, spec: &ToolSpec) -> Result<ImplementationReport, EvolutionError> {
        let payload = serde_json::to_value(spec)?;
        post_json(&self.client, "implementer", &self.url, &payload).await
    }
}
