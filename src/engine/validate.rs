use crate::limits::*;
use crate::model::*;

use super::error::TimespanError;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Strictly positive, inside the representable range, no longer than `max_span`.
pub fn validate_timespan(span: &Span, max_span: Ms) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::InvalidTimespan(TimespanError::NotPositive));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidTimespan(TimespanError::OutOfRange));
    }
    if span.duration_ms() > max_span {
        return Err(EngineError::InvalidTimespan(TimespanError::TooLong {
            max_ms: max_span,
        }));
    }
    Ok(())
}

fn required(field: &'static str, value: &str, max_len: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} is required")));
    }
    bounded(field, value, max_len)
}

fn bounded(field: &'static str, value: &str, max_len: usize) -> Result<(), EngineError> {
    if value.chars().count() > max_len {
        return Err(EngineError::InvalidInput(format!(
            "{field} longer than {max_len} characters"
        )));
    }
    Ok(())
}

pub(crate) fn validate_resource_fields(name: &str, remarks: &str) -> Result<(), EngineError> {
    required("name", name, MAX_NAME_LEN)?;
    bounded("remarks", remarks, MAX_REMARKS_LEN)
}

pub(crate) fn validate_reservation_fields(
    name: &str,
    contact: &str,
    remarks: &str,
) -> Result<(), EngineError> {
    required("name", name, MAX_NAME_LEN)?;
    required("contact", contact, MAX_CONTACT_LEN)?;
    bounded("remarks", remarks, MAX_REMARKS_LEN)
}
