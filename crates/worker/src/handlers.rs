use std::time::Duration;

use jobflow::api::{RANDOM_TEXT_JOB, WEBHOOK_JOB};
use jobflow::jobs::{boxed, parse_payload, HandlerOptions, HandlerRegistry, JobError};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

pub const ECHO_JOB: &str = "echo";

const WORDS: [&str; 20] = [
    "cloud",
    "computing",
    "platform",
    "service",
    "data",
    "storage",
    "network",
    "server",
    "virtual",
    "container",
    "function",
    "application",
    "microservice",
    "kubernetes",
    "docker",
    "infrastructure",
    "code",
    "deployment",
    "scaling",
    "monitoring",
];

/// Simulated work before random text is produced.
const RANDOM_TEXT_DELAY: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct RandomTextPayload {
    length: usize,
}

#[derive(Deserialize)]
struct EchoPayload {
    n: u64,
}

#[derive(Deserialize)]
struct WebhookPayload {
    source: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

pub fn random_text(length: usize, rng: &mut impl Rng) -> String {
    (0..length)
        .filter_map(|_| WORDS.choose(rng).copied())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register_with_options(
        RANDOM_TEXT_JOB,
        |job| {
            boxed(async move {
                let payload: RandomTextPayload = parse_payload(job)?;
                if payload.length == 0 {
                    return Err(JobError::bad_payload("length must be > 0"));
                }
                tokio::time::sleep(RANDOM_TEXT_DELAY).await;

                let text = random_text(payload.length, &mut rand::thread_rng());
                tracing::debug!(job_id = %job.id, words = payload.length, "random text generated");
                Ok(Value::String(text))
            })
        },
        HandlerOptions::new()
            .max_concurrency(16)
            .timeout(Duration::from_secs(30)),
    );

    registry.register(ECHO_JOB, |job| {
        boxed(async move {
            let payload: EchoPayload = parse_payload(job)?;
            Ok(Value::String(format!("{} words", payload.n)))
        })
    });

    registry.register_with_options(
        WEBHOOK_JOB,
        |job| {
            boxed(async move {
                let payload: WebhookPayload = parse_payload(job)?;
                tracing::info!(
                    job_id = %job.id,
                    source = %payload.source,
                    event = %payload.event,
                    "processing webhook"
                );
                Ok(json!({
                    "source": payload.source,
                    "event": payload.event,
                    "fields": payload.payload.as_object().map(|o| o.len()).unwrap_or(0),
                }))
            })
        },
        HandlerOptions::new().timeout(Duration::from_secs(10)),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow::jobs::{Job, NewJob};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn random_text_uses_the_word_list() {
        let mut rng = StdRng::seed_from_u64(7);
        let text = random_text(12, &mut rng);
        let words: Vec<&str> = text.split(' ').collect();

        assert_eq!(words.len(), 12);
        assert!(words.iter().all(|w| WORDS.contains(w)));
    }

    #[tokio::test]
    async fn echo_reports_word_count() {
        let registry = build_registry();
        let job = Job::pending(NewJob::new(ECHO_JOB, json!({"n": 5})));

        let out = registry.handler_for(ECHO_JOB).unwrap().run(&job).await.unwrap();
        assert_eq!(out, json!("5 words"));
    }

    #[tokio::test]
    async fn webhook_without_source_is_bad_payload() {
        let registry = build_registry();
        let job = Job::pending(NewJob::new(WEBHOOK_JOB, json!({"event": "push"})));

        let err = registry
            .handler_for(WEBHOOK_JOB)
            .unwrap()
            .run(&job)
            .await
            .unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
    }

    #[test]
    fn registry_covers_api_job_types() {
        let types = build_registry().job_types();
        assert_eq!(types, vec!["echo", "process_webhook", "random_text"]);
    }
}
