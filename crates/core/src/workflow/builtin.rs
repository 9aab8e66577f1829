//! Simulated handlers for the standard step catalogue.
//!
//! None of these talk to a real provider; they validate their parameters and
//! return a result shaped like the provider's response.

use super::handler::HandlerRegistry;
use crate::types::Payload;
use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_EMAIL_SUBJECT: &str = "FlowPilot Notification";

/// Register every built-in handler
pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry.register("send_sms", send_sms);
    registry.register("send_email", send_email);
    registry.register("create_patient", create_patient);
    registry.register("delay", delay);
    registry.register("noop", noop);
}

/// Handler parameters: step config overlaid with the step's input
fn params(config: &Payload, input: &Payload) -> Payload {
    let mut merged = config.clone();
    for (key, value) in input {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn non_empty_str<'a>(params: &'a Payload, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn send_sms(config: &Payload, input: &Payload) -> Result<Payload> {
    let params = params(config, input);
    let (Some(phone), Some(message)) = (
        non_empty_str(&params, "phone"),
        non_empty_str(&params, "message"),
    ) else {
        bail!("SMS step requires 'phone' and 'message'");
    };

    tracing::info!("Sending SMS to {}", phone);

    Ok(into_payload(json!({
        "sms_sent": true,
        "sms_id": format!("sms_{}", uuid::Uuid::new_v4().simple()),
        "phone": phone,
        "message": message,
        "sent_at": Utc::now().to_rfc3339(),
    })))
}

fn send_email(config: &Payload, input: &Payload) -> Result<Payload> {
    let params = params(config, input);
    let Some(email) = non_empty_str(&params, "email") else {
        bail!("Email step requires 'email'");
    };
    let content = non_empty_str(&params, "content").or_else(|| non_empty_str(&params, "message"));
    if content.is_none() && non_empty_str(&params, "template").is_none() {
        bail!("Email step requires 'content' or 'template'");
    }
    let subject = non_empty_str(&params, "subject").unwrap_or(DEFAULT_EMAIL_SUBJECT);

    tracing::info!("Sending email to {}: {}", email, subject);

    Ok(into_payload(json!({
        "email_sent": true,
        "email": email,
        "subject": subject,
        "message_id": format!("email_{}", uuid::Uuid::new_v4().simple()),
        "sent_at": Utc::now().to_rfc3339(),
    })))
}

fn create_patient(config: &Payload, input: &Payload) -> Result<Payload> {
    let params = params(config, input);
    let Some(name) = non_empty_str(&params, "name") else {
        bail!("Patient creation requires 'name'");
    };

    tracing::info!("Creating patient record for {}", name);

    Ok(into_payload(json!({
        "patient_created": true,
        "patient_id": uuid::Uuid::new_v4().to_string(),
        "name": name,
        "phone": params.get("phone").cloned().unwrap_or(Value::Null),
        "email": params.get("email").cloned().unwrap_or(Value::Null),
        "created_at": Utc::now().to_rfc3339(),
    })))
}

fn delay(config: &Payload, input: &Payload) -> Result<Payload> {
    let params = params(config, input);
    let seconds = match params.get("seconds") {
        None => 1.0,
        Some(value) => match value.as_f64() {
            Some(seconds) if seconds >= 0.0 && seconds.is_finite() => seconds,
            _ => bail!("Delay step requires a non-negative numeric 'seconds'"),
        },
    };

    tracing::debug!("Delaying for {} seconds", seconds);
    std::thread::sleep(Duration::from_secs_f64(seconds));

    Ok(into_payload(json!({
        "delay_completed": true,
        "delayed_seconds": seconds,
        "completed_at": Utc::now().to_rfc3339(),
    })))
}

fn noop(_config: &Payload, input: &Payload) -> Result<Payload> {
    Ok(input.clone())
}
