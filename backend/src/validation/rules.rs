//! Common validation rules shared across request payloads.

use validator::ValidationError;

/// Validates a display name.
///
/// Requirements:
/// - At least 2 characters once surrounding whitespace is removed
/// - At most 100 characters
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let length = name.trim().chars().count();
    if length < 2 {
        return Err(ValidationError::new("display_name_too_short"));
    }
    if length > 100 {
        return Err(ValidationError::new("display_name_too_long"));
    }
    Ok(())
}
