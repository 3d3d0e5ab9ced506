//! Scripted-journey executor: the four-step state machine each virtual
//! user runs against the target (`4.3`).

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::client::{extract_play_id, Dispatcher};
use crate::config::JourneyVariant;
use crate::errors::StepError;
use crate::metrics::{
    CONCURRENT_JOURNEYS, JOURNEY_DURATION_SECONDS, JOURNEY_EXECUTIONS_TOTAL, JOURNEY_STEPS_TOTAL,
    JOURNEY_STEP_DURATION_SECONDS,
};
use crate::percentiles::{GLOBAL_JOURNEY_PERCENTILES, GLOBAL_STEP_PERCENTILES};
use crate::session::SessionStore;
use crate::state_vector::StateVector;

const STATIC_ASSETS_STEP1: &[&str] = &[
    "/static/cdn/crossword.css",
    "/static/cdn/crossword.js",
    "https://fonts.example.com/font-a.woff2",
    "https://fonts.example.com/font-b.woff2",
];

const STATIC_ASSETS_STEP3: &[&str] = &["/static/cdn/board.css", "/static/cdn/board.js"];

/// `{start_timestamp, end_timestamp, latency_ms, uid?}` for a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub start_timestamp: u128,
    pub end_timestamp: u128,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// One iteration of step 4: `{iteration, play_state, latency_ms}`.
#[derive(Debug, Clone, Serialize)]
pub struct IterationResult {
    pub iteration: u8,
    pub play_state: u8,
    pub latency_ms: u64,
}

/// Per-step outcome: timing plus success/error.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub timing: Option<StepTiming>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<Vec<IterationResult>>,
}

impl StepResult {
    fn failed(error: StepError) -> Self {
        Self {
            timing: None,
            success: false,
            error: Some(error.to_string()),
            iterations: None,
        }
    }

    fn ok(timing: StepTiming) -> Self {
        Self {
            timing: Some(timing),
            success: true,
            error: None,
            iterations: None,
        }
    }
}

/// Aggregates the four step results plus an overall success flag. A
/// journey succeeds iff every step succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct JourneyResult {
    pub uid: String,
    pub step1: StepResult,
    pub step2: StepResult,
    pub step3: StepResult,
    pub step4: StepResult,
    pub success: bool,
}

impl JourneyResult {
    /// Sum of step-1, step-2, step-3 latencies plus the sum of step-4
    /// iteration latencies (`4.5`).
    pub fn total_latency_ms(&self) -> u64 {
        let mut total = 0u64;
        for step in [&self.step1, &self.step2, &self.step3] {
            if let Some(t) = &step.timing {
                total += t.latency_ms;
            }
        }
        if let Some(iterations) = &self.step4.iterations {
            total += iterations.iter().map(|i| i.latency_ms).sum::<u64>();
        }
        total
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

async fn timed<F, Fut>(f: F) -> (StepTiming, Result<String, StepError>)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, StepError>>,
{
    let start_wall = now_ms();
    let start = Instant::now();
    let result = f().await;
    let elapsed = start.elapsed().as_millis() as u64;
    let timing = StepTiming {
        start_timestamp: start_wall,
        end_timestamp: start_wall + elapsed as u128,
        latency_ms: elapsed,
        uid: None,
    };
    (timing, result)
}

/// Executes the full scripted journey for one virtual user against one
/// puzzle, using a single logical session from `sessions`.
pub struct JourneyExecutor {
    dispatcher: Dispatcher,
    sessions: Arc<SessionStore>,
    target_url: String,
    series: String,
    puzzle_id: String,
    state_len: usize,
    variant: JourneyVariant,
}

impl JourneyExecutor {
    pub fn new(
        dispatcher: Dispatcher,
        sessions: Arc<SessionStore>,
        target_url: String,
        series: String,
        puzzle_id: String,
        state_len: usize,
        variant: JourneyVariant,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            target_url,
            series,
            puzzle_id,
            state_len,
            variant,
        }
    }

    pub async fn run(&self, uid: &str, rng: &mut impl Rng) -> JourneyResult {
        CONCURRENT_JOURNEYS.inc();
        let start = Instant::now();
        let result = self.run_inner(uid, rng).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        CONCURRENT_JOURNEYS.dec();

        let status = if result.success { "success" } else { "failed" };
        JOURNEY_EXECUTIONS_TOTAL.with_label_values(&[status]).inc();
        JOURNEY_DURATION_SECONDS.observe(elapsed_ms as f64 / 1000.0);
        GLOBAL_JOURNEY_PERCENTILES.record(uid, elapsed_ms);

        result
    }

    async fn run_inner(&self, uid: &str, rng: &mut impl Rng) -> JourneyResult {
        let (step1, load_token) = self.step1_date_picker(uid).await;
        record_step("1", &step1);

        if !step1.success {
            return JourneyResult {
                uid: uid.to_string(),
                step1,
                step2: StepResult::failed(StepError::SessionUnavailable(
                    "skipped: step 1 failed".into(),
                )),
                step3: StepResult::failed(StepError::SessionUnavailable(
                    "skipped: step 1 failed".into(),
                )),
                step4: StepResult::failed(StepError::SessionUnavailable(
                    "skipped: step 1 failed".into(),
                )),
                success: false,
            };
        }

        let step2 = self.step2_post_picker_status(uid, &load_token).await;
        record_step("2", &step2);
        if !step2.success {
            return JourneyResult {
                uid: uid.to_string(),
                step1,
                step2,
                step3: StepResult::failed(StepError::SessionUnavailable("skipped: step 2 failed".into())),
                step4: StepResult::failed(StepError::SessionUnavailable("skipped: step 2 failed".into())),
                success: false,
            };
        }

        let (step3, play_id) = self.step3_load_crossword(uid, &load_token).await;
        record_step("3", &step3);
        if !step3.success {
            return JourneyResult {
                uid: uid.to_string(),
                step1,
                step2,
                step3,
                step4: StepResult::failed(StepError::SessionUnavailable("skipped: step 3 failed".into())),
                success: false,
            };
        }

        let step4 = self
            .step4_play_posts(uid, &load_token, &play_id, rng)
            .await;
        record_step("4", &step4);
        let success = step4.success;

        JourneyResult {
            uid: uid.to_string(),
            step1,
            step2,
            step3,
            step4,
            success,
        }
    }

    /// Step 1 is serviced through the session store: the derivation fetch
    /// it triggers (or awaits, if already in flight for this user) is the
    /// same `GET /date-picker` the spec describes for this step, so
    /// concurrent journeys for the same user naturally coalesce here.
    async fn step1_date_picker(&self, uid: &str) -> (StepResult, String) {
        let start_wall = now_ms();
        let start = Instant::now();
        let tokens = self
            .sessions
            .get_or_create(uid, &self.puzzle_id, &self.series)
            .await;
        let mut latency_ms = start.elapsed().as_millis() as u64;

        if !tokens.valid {
            let error = tokens.error.unwrap_or_else(|| "invalid session".into());
            return (StepResult::failed(StepError::SessionUnavailable(error)), String::new());
        }

        if matches!(self.variant, JourneyVariant::StandardPlusStaticAssets) {
            latency_ms += self.fetch_static_assets(STATIC_ASSETS_STEP1).await;
        }

        let timing = StepTiming {
            start_timestamp: start_wall,
            end_timestamp: start_wall + latency_ms as u128,
            latency_ms,
            uid: Some(uid.to_string()),
        };

        (StepResult::ok(timing), tokens.load_token)
    }

    /// Non-fatal by design (`9`): failures here are reported but never
    /// propagated into the journey's success flag.
    async fn fetch_static_assets(&self, urls: &[&str]) -> u64 {
        let mut total = 0u64;
        for url in urls {
            let start = Instant::now();
            let _ = self.dispatcher.fire(self.dispatcher.client().get(*url)).await;
            total += start.elapsed().as_millis() as u64;
        }
        total
    }

    async fn step2_post_picker_status(&self, uid: &str, load_token: &str) -> StepResult {
        let url = format!("{}/postPickerStatus", self.target_url);
        let payload = json!({
            "loadToken": load_token,
            "uid": uid,
            "series": self.series,
            "id": self.puzzle_id,
        });

        let (timing, result) = timed(|| async {
            let response = self
                .dispatcher
                .fire(self.dispatcher.client().post(&url).json(&payload))
                .await?;
            check_status_zero(&response.body)?;
            Ok(response.body)
        })
        .await;

        match result {
            Ok(_) => StepResult::ok(timing),
            Err(e) => StepResult::failed(e),
        }
    }

    async fn step3_load_crossword(&self, uid: &str, load_token: &str) -> (StepResult, String) {
        let url = format!(
            "{}/crossword?id={}&set={}&uid={}&loadToken={}",
            self.target_url, self.puzzle_id, self.series, uid, load_token
        );

        let (timing, body) = timed(|| async {
            let response = self
                .dispatcher
                .fire(self.dispatcher.client().get(&url))
                .await?;
            Ok(response.body)
        })
        .await;

        match body {
            Ok(html) => {
                let play_id = extract_play_id(&html).unwrap_or_default();
                let mut timing = timing;
                if matches!(self.variant, JourneyVariant::StandardPlusStaticAssets) {
                    let extra_ms = self.fetch_static_assets(STATIC_ASSETS_STEP3).await;
                    timing.latency_ms += extra_ms;
                    timing.end_timestamp += extra_ms as u128;
                }
                (StepResult::ok(timing), play_id)
            }
            Err(e) => (StepResult::failed(e), String::new()),
        }
    }

    async fn step4_play_posts(
        &self,
        uid: &str,
        load_token: &str,
        play_id: &str,
        rng: &mut impl Rng,
    ) -> StepResult {
        let url = format!("{}/api/v1/plays", self.target_url);
        let mut vector = StateVector::initial(self.state_len, rng);
        let mut iterations = Vec::with_capacity(10);

        for i in 1u8..=10 {
            let play_state = match i {
                1 => 1,
                10 => 4,
                _ => 2,
            };

            if i == 10 {
                vector = StateVector::complete(self.state_len, rng);
            } else if i > 1 {
                vector.mutate(rng);
            }

            let payload = build_play_payload(
                load_token,
                &self.series,
                &self.puzzle_id,
                play_id,
                uid,
                play_state,
                &vector,
            );

            let start = Instant::now();
            let outcome = async {
                let response = self
                    .dispatcher
                    .fire(self.dispatcher.client().post(&url).json(&payload))
                    .await?;
                check_status_zero(&response.body)
            }
            .await;
            let latency_ms = start.elapsed().as_millis() as u64;

            if let Err(e) = outcome {
                return StepResult {
                    timing: None,
                    success: false,
                    error: Some(e.to_string()),
                    iterations: Some(iterations),
                };
            }

            iterations.push(IterationResult {
                iteration: i,
                play_state,
                latency_ms,
            });
        }

        StepResult {
            timing: None,
            success: true,
            error: None,
            iterations: Some(iterations),
        }
    }
}

/// Records the step-level Prometheus counters and percentile sample for a
/// completed step. Step 4 has no single `timing`, so its latency is the sum
/// of its iteration latencies instead.
fn record_step(step: &str, result: &StepResult) {
    let status = if result.success { "success" } else { "failed" };
    JOURNEY_STEPS_TOTAL.with_label_values(&[step, status]).inc();

    let latency_ms = result
        .timing
        .as_ref()
        .map(|t| t.latency_ms)
        .or_else(|| result.iterations.as_ref().map(|it| it.iter().map(|i| i.latency_ms).sum()));

    if let Some(latency_ms) = latency_ms {
        JOURNEY_STEP_DURATION_SECONDS
            .with_label_values(&[step])
            .observe(latency_ms as f64 / 1000.0);
        GLOBAL_STEP_PERCENTILES.record(step, latency_ms);
    }
}

fn check_status_zero(body: &str) -> Result<(), StepError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| StepError::Parse(format!("invalid JSON response: {}", e)))?;
    match value.get("status").and_then(serde_json::Value::as_i64) {
        Some(0) => Ok(()),
        Some(other) => Err(StepError::Logic(format!("status != 0 (got {})", other))),
        None => Err(StepError::Parse("missing status field".to_string())),
    }
}

fn build_play_payload(
    load_token: &str,
    series: &str,
    puzzle_id: &str,
    play_id: &str,
    uid: &str,
    play_state: u8,
    vector: &StateVector,
) -> serde_json::Value {
    let now = now_ms();
    json!({
        "loadToken": load_token,
        "updatePlayTable": true,
        "updateLoadTable": false,
        "series": series,
        "id": puzzle_id,
        "playId": play_id,
        "userId": uid,
        "browser": "rust-loadgen",
        "streakLength": 0,
        "getProgressFromBackend": true,
        "fromPicker": "date-picker",
        "inContestMode": false,
        "timestamp": now,
        "updatedTimestamp": now,
        "playState": play_state,
        "timeTaken": 0,
        "score": 0,
        "timeOnPage": 0,
        "nPrints": 0,
        "nPrintsEmpty": 0,
        "nPrintsFilled": 0,
        "nPrintsSol": 0,
        "nClearClicks": 0,
        "nSettingsClicks": 0,
        "nHelpClicks": 0,
        "nResizes": 0,
        "nExceptions": 0,
        "postScoreReason": "AUTOSAVE",
        "primaryState": vector.primary_state(),
        "secondaryState": vector.secondary_state(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Dispatcher;
    use base64::Engine;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params_html(rawsps: &str, rawp: &str) -> String {
        let rawsps_b64 = base64::engine::general_purpose::STANDARD.encode(rawsps);
        let rawp_b64 = base64::engine::general_purpose::STANDARD.encode(rawp);
        format!(
            r#"<script id="params" type="application/json">{{"rawsps":"{}","rawp":"{}"}}</script>"#,
            rawsps_b64, rawp_b64
        )
    }

    async fn mock_target() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/date-picker"))
            .respond_with(ResponseTemplate::new(200).set_body_string(params_html(r#"{"loadToken":"tok"}"#, "")))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/postPickerStatus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 0})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/crossword"))
            .respond_with(ResponseTemplate::new(200).set_body_string(params_html("", r#"{"playId":"p1"}"#)))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/v1/plays"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 0})))
            .mount(&server)
            .await;

        server
    }

    #[tokio::test]
    async fn successful_journey_has_ten_iterations_in_order() {
        let server = mock_target().await;
        let dispatcher = Dispatcher::new(reqwest::Client::new(), 200, 100);
        let sessions = Arc::new(SessionStore::new(dispatcher.clone(), server.uri()));
        let executor = JourneyExecutor::new(
            dispatcher,
            sessions,
            server.uri(),
            "default".to_string(),
            "d4725144".to_string(),
            185,
            JourneyVariant::Standard,
        );

        let mut rng = StdRng::seed_from_u64(42);
        let result = executor.run("vansh", &mut rng).await;

        assert!(result.success);
        let iterations = result.step4.iterations.as_ref().unwrap();
        assert_eq!(iterations.len(), 10);
        let play_states: Vec<u8> = iterations.iter().map(|i| i.play_state).collect();
        assert_eq!(play_states, vec![1, 2, 2, 2, 2, 2, 2, 2, 2, 4]);
    }

    #[tokio::test]
    async fn failure_on_picker_status_skips_remaining_steps() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/date-picker"))
            .respond_with(ResponseTemplate::new(200).set_body_string(params_html(r#"{"loadToken":"tok"}"#, "")))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/postPickerStatus"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), 200, 100);
        let sessions = Arc::new(SessionStore::new(dispatcher.clone(), server.uri()));
        let executor = JourneyExecutor::new(
            dispatcher,
            sessions,
            server.uri(),
            "default".to_string(),
            "d4725144".to_string(),
            185,
            JourneyVariant::Standard,
        );

        let mut rng = StdRng::seed_from_u64(1);
        let result = executor.run("vansh", &mut rng).await;

        assert!(!result.success);
        assert!(result.step2.error.as_ref().unwrap().contains("500"));
        assert!(result.step3.timing.is_none());
        assert!(result.step4.timing.is_none());
    }
}
