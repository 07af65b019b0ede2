// ============================================================================
// Job Validation & Phone Normalization
// ============================================================================

use crate::config::{MAX_MESSAGE_LENGTH, MAX_PHONE_DIGITS, MIN_PHONE_DIGITS};
use crate::error::{DispatchError, DispatchResult};
use crate::models::DispatchJob;

/// Required-field and size checks. Failing here is a permanent failure:
/// the job is recorded as `failed` and never retried.
pub fn validate_job(job: &DispatchJob) -> DispatchResult<()> {
    if job.company_id.is_nil() {
        return Err(DispatchError::validation("job is missing a company id"));
    }
    if job.phone.trim().is_empty() {
        return Err(DispatchError::validation("job is missing a phone number"));
    }
    if job.content.is_empty() {
        return Err(DispatchError::validation("job has empty content"));
    }
    if job.content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(DispatchError::validation(format!(
            "content exceeds {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    if !job.phone.chars().any(|c| c.is_ascii_digit()) {
        return Err(DispatchError::validation("phone contains no digits"));
    }
    Ok(())
}

/// Normalize a raw phone into channel form: strip everything that is not
/// a digit, drop leading zeros, prefix the default country code onto
/// 10-11 digit national numbers, and enforce the 10-15 digit bounds.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> DispatchResult<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = digits.trim_start_matches('0');

    let mut number = national.to_string();
    if (number.len() == 10 || number.len() == 11) && !number.starts_with(default_country_code) {
        number = format!("{}{}", default_country_code, number);
    }

    if number.len() < MIN_PHONE_DIGITS || number.len() > MAX_PHONE_DIGITS {
        return Err(DispatchError::validation(format!(
            "normalized phone has {} digits, expected {}-{}",
            number.len(),
            MIN_PHONE_DIGITS,
            MAX_PHONE_DIGITS
        )));
    }
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn job(phone: &str, content: &str) -> DispatchJob {
        DispatchJob {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            campaign_id: None,
            contact_id: None,
            message_log_id: Uuid::new_v4(),
            phone: phone.to_string(),
            content: content.to_string(),
            integration_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(validate_job(&job("", "hi")).is_err());
        assert!(validate_job(&job("5511999887766", "")).is_err());
        assert!(validate_job(&job("no-digits-here", "hi")).is_err());
        assert!(validate_job(&job("5511999887766", "hi")).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_content() {
        let long = "a".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(validate_job(&job("5511999887766", &long)).is_err());
    }

    #[test]
    fn test_normalize_strips_formatting() {
        assert_eq!(
            normalize_phone("+55 (11) 99988-7766", "55").unwrap(),
            "5511999887766"
        );
    }

    #[test]
    fn test_normalize_prefixes_national_numbers() {
        // 11-digit national number gets the country code.
        assert_eq!(normalize_phone("11999887766", "55").unwrap(), "5511999887766");
        // Already carrying the country code: untouched.
        assert_eq!(normalize_phone("5511999887766", "55").unwrap(), "5511999887766");
    }

    #[test]
    fn test_normalize_drops_leading_zeros() {
        assert_eq!(normalize_phone("011999887766", "55").unwrap(), "5511999887766");
    }

    #[test]
    fn test_normalize_rejects_out_of_bounds() {
        assert!(normalize_phone("123456", "55").is_err());
        assert!(normalize_phone("12345678901234567", "55").is_err());
    }
}
