use crate::cli::OutputFormat;
use serde_json::json;
use swarm::SwarmError;

pub fn emit_output(output: &OutputFormat, command: &str, payload: serde_json::Value) {
    match output {
        OutputFormat::Text => payload
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| println!("{payload}"), |msg| println!("{msg}")),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "command": command,
                "status": "ok",
                "payload": payload,
            })
        ),
    }
}

pub fn emit_error(output: &OutputFormat, command: &str, message: &str, code: &str) {
    match output {
        OutputFormat::Text => eprintln!("error: {message}"),
        OutputFormat::Json => eprintln!(
            "{}",
            json!({
                "command": command,
                "status": "error",
                "code": code,
                "message": message,
            })
        ),
    }
}

pub const fn map_error_to_exit_code(error: &SwarmError) -> i32 {
    match error {
        SwarmError::ConfigError(_) => 2,
        SwarmError::DatabaseError(_) | SwarmError::SqlxError(_) | SwarmError::StoreTimeout(_) => 3,
        SwarmError::DispatchFailed(_) => 4,
        SwarmError::BeadError(_)
        | SwarmError::AlreadyClaimed { .. }
        | SwarmError::AmbiguousBead { .. } => 5,
        SwarmError::StageError(_) => 6,
        SwarmError::IoError(_) => 7,
        SwarmError::SerializationError(_) => 8,
        SwarmError::FaultInjected { .. } | SwarmError::Internal(_) => 1,
    }
}
