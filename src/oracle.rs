//! Model oracle: turns a market snapshot into a disciplined trading
//! decision by prompting a locally-hosted language model.
//!
//! The response contract is three lines (action, confidence, reason) and
//! the parser is total: any malformed output degrades to a low-confidence
//! Hold instead of an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::types::{Action, Decision, MarketSnapshot};

const SYSTEM_PROMPT: &str = "You are a trading bot. Respond with exactly 3 lines:\n\
Line 1: BUY or SELL or NOTHING\n\
Line 2: A number between 0.1 and 0.9\n\
Line 3: A reason\n\
\n\
Example response:\n\
BUY\n\
0.6\n\
Price up 2%\n\
\n\
Do not include any other text. Only output these 3 lines.";

const FALLBACK_REASONING: &str = "Analysis based on current market conditions";
const INVALID_FORMAT_REASONING: &str = "invalid response format";
const DEFAULT_CONFIDENCE: f64 = 0.3;
const MAX_REASONING_LEN: usize = 280;

/// Capability contract: total decisioning over a snapshot.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, snapshot: &MarketSnapshot) -> Decision;
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Oracle backed by an Ollama-style endpoint.
pub struct OllamaOracle {
    client: Client,
    base_url: String,
    model: String,
    /// Set once the model has been pulled; cleared state means every decide
    /// re-attempts the pull until one succeeds.
    loaded: AtomicBool,
    monitor: Monitor,
}

impl OllamaOracle {
    pub fn new(base_url: &str, model: &str, monitor: Monitor) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            loaded: AtomicBool::new(false),
            monitor,
        }
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.monitor
            .system(&format!("loading model {}", self.model));
        let body = json!({ "name": self.model, "stream": false });
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::OracleDegraded(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::OracleDegraded(format!(
                "model pull returned status {}",
                response.status()
            )));
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn chat(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
            "stream": false,
            "options": {
                // Low temperature and a fixed seed keep the format stable.
                "temperature": 0.1,
                "top_p": 0.1,
                "top_k": 10,
                "seed": 1234,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status.as_u16()));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        Ok(parsed.message.content)
    }

    fn prompt_for(&self, snapshot: &MarketSnapshot) -> String {
        format!(
            "Analyze this data and respond with exactly 3 lines:\n\
             Token: {}\n\
             Price: {:.8} SOL\n\
             Volume: {:.2} SOL\n\
             \n\
             Remember:\n\
             - Line 1: BUY/SELL/NOTHING\n\
             - Line 2: 0.1-0.9\n\
             - Line 3: reason",
            snapshot.token, snapshot.price, snapshot.volume_24h
        )
    }
}

#[async_trait]
impl Oracle for OllamaOracle {
    async fn decide(&self, snapshot: &MarketSnapshot) -> Decision {
        if let Err(e) = self.ensure_loaded().await {
            self.monitor
                .failure(&format!("oracle degraded, holding: {e}"));
            return Decision::hold("model unavailable", &self.model);
        }

        let started = Instant::now();
        let content = match self.chat(&self.prompt_for(snapshot)).await {
            Ok(content) => content,
            Err(e) => {
                self.monitor
                    .failure(&format!("model chat failed for {}: {e}", snapshot.token));
                return Decision::hold("model request failed", &self.model);
            }
        };
        self.monitor.perf("decision generation", started.elapsed());

        let decision = parse_decision(&content, &self.model);
        self.monitor
            .ai_signal(&snapshot.token, decision.action.as_str(), decision.confidence);
        decision
    }
}

/// Total parser over free-form model output. Every input yields a decision;
/// confidence lands in [0.1, 0.9] and reasoning is never empty.
pub fn parse_decision(content: &str, model_tag: &str) -> Decision {
    let cleaned = content.replace("```", "");
    let lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.len() < 3 {
        return Decision::hold(INVALID_FORMAT_REASONING, model_tag);
    }

    let action = lines[0]
        .split_whitespace()
        .find_map(|word| match word.to_ascii_uppercase().as_str() {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            "NOTHING" => Some(Action::Hold),
            _ => None,
        })
        .unwrap_or(Action::Hold);

    // First line after the action that parses as a finite real.
    let mut confidence = DEFAULT_CONFIDENCE;
    let mut reasoning_start = 1;
    for (idx, line) in lines.iter().enumerate().skip(1) {
        if let Ok(value) = line.parse::<f64>() {
            if value.is_finite() {
                confidence = value.clamp(0.1, 0.9);
                reasoning_start = idx + 1;
                break;
            }
        }
    }

    let mut reasoning = lines[reasoning_start.min(lines.len())..].join(" ");
    if reasoning.is_empty() {
        reasoning = FALLBACK_REASONING.to_string();
    }
    if reasoning.len() > MAX_REASONING_LEN {
        let mut end = MAX_REASONING_LEN;
        while !reasoning.is_char_boundary(end) {
            end -= 1;
        }
        reasoning.truncate(end);
    }

    Decision {
        action,
        confidence,
        reasoning,
        model_tag: model_tag.to_string(),
        produced_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_response_parses() {
        let decision = parse_decision("BUY\n0.6\nPrice up 2%", "test-model");
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.confidence, 0.6);
        assert_eq!(decision.reasoning, "Price up 2%");
        assert_eq!(decision.model_tag, "test-model");
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let decision = parse_decision("BUY\n1.5\ngood setup", "m");
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.confidence, 0.9);
        assert_eq!(decision.reasoning, "good setup");

        let low = parse_decision("SELL\n0.01\nweak chart", "m");
        assert_eq!(low.confidence, 0.1);
    }

    #[test]
    fn missing_action_verb_degrades_to_hold() {
        let decision = parse_decision("hello world", "m");
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.confidence, 0.1);
        assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn fewer_than_three_lines_is_invalid_format() {
        let decision = parse_decision("BUY\n0.5", "m");
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.confidence, 0.1);
        assert_eq!(decision.reasoning, INVALID_FORMAT_REASONING);
    }

    #[test]
    fn empty_input_yields_hold() {
        let decision = parse_decision("", "m");
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.confidence, 0.1);
    }

    #[test]
    fn code_fences_are_stripped() {
        let decision = parse_decision("```\nSELL\n0.7\novervalued\n```", "m");
        assert_eq!(decision.action, Action::Sell);
        assert_eq!(decision.confidence, 0.7);
        assert_eq!(decision.reasoning, "overvalued");
    }

    #[test]
    fn action_match_is_case_insensitive() {
        let decision = parse_decision("buy now\n0.8\nmomentum", "m");
        assert_eq!(decision.action, Action::Buy);
    }

    #[test]
    fn nothing_maps_to_hold() {
        let decision = parse_decision("NOTHING\n0.4\nflat market", "m");
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.confidence, 0.4);
    }

    #[test]
    fn unparseable_confidence_defaults() {
        let decision = parse_decision("BUY\nvery sure\nbreakout", "m");
        assert_eq!(decision.action, Action::Buy);
        assert_eq!(decision.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(decision.reasoning, "very sure breakout");
    }

    #[test]
    fn missing_reasoning_falls_back() {
        let decision = parse_decision("BUY\nnoise\n0.5", "m");
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.reasoning, FALLBACK_REASONING);
    }

    #[test]
    fn non_finite_confidence_is_ignored() {
        let decision = parse_decision("BUY\nNaN\n0.6\nsteady", "m");
        assert_eq!(decision.confidence, 0.6);
        assert_eq!(decision.reasoning, "steady");
    }

    #[test]
    fn reasoning_is_bounded() {
        let long = "x".repeat(1000);
        let decision = parse_decision(&format!("BUY\n0.5\n{long}"), "m");
        assert!(decision.reasoning.len() <= MAX_REASONING_LEN);
    }
}
