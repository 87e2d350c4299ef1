use serde_json::Value;

pub const MAX_SERVICE_LENGTH: usize = 100;
pub const MAX_EVENT_LENGTH: usize = 100;
pub const MAX_FIELD_LENGTH: usize = 1000;

/// A payload that passed validation, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub service: String,
    pub event: String,
    pub error: bool,
    pub message: String,
}

/// Checks an inbound payload. The first failing rule wins and its message is
/// returned verbatim to the caller.
pub fn validate(payload: &Value) -> Result<NewNotification, String> {
    let Some(obj) = payload.as_object() else {
        return Err("Payload must be a JSON object".to_string());
    };

    if !obj.contains_key("service") || !obj.contains_key("message") {
        return Err("Missing required fields: service and message".to_string());
    }

    let service = match obj.get("service") {
        Some(Value::String(s)) if char_len(s) <= MAX_SERVICE_LENGTH => s.clone(),
        _ => {
            return Err(format!(
                "Field 'service' must be a string of at most {} characters",
                MAX_SERVICE_LENGTH
            ))
        }
    };

    let event = match obj.get("event") {
        None => String::new(),
        Some(Value::String(s)) if char_len(s) <= MAX_EVENT_LENGTH => s.clone(),
        Some(_) => {
            return Err(format!(
                "Field 'event' must be a string of at most {} characters",
                MAX_EVENT_LENGTH
            ))
        }
    };

    let message = match obj.get("message") {
        Some(Value::String(s)) if char_len(s) <= MAX_FIELD_LENGTH => s.clone(),
        _ => {
            return Err(format!(
                "Field 'message' must be a string of at most {} characters",
                MAX_FIELD_LENGTH
            ))
        }
    };

    let error = match obj.get("error") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err("Field 'error' must be a boolean".to_string()),
    };

    Ok(NewNotification {
        service,
        event,
        error,
        message,
    })
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
