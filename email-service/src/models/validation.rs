use crate::error::EmailServiceError;

pub const MAX_SUBJECT_LEN: usize = 255;
pub const MAX_TEMPLATE_NAME_LEN: usize = 255;
const MAX_ADDRESS_LEN: usize = 254;

fn invalid(field: &str, message: impl std::fmt::Display) -> EmailServiceError {
    EmailServiceError::Validation(format!("{}: {}", field, message))
}

/// Syntactic check of a bare `local@domain` address.
pub fn validate_email_address(field: &str, address: &str) -> Result<(), EmailServiceError> {
    if address.trim().is_empty() {
        return Err(invalid(field, "email address cannot be empty"));
    }

    if address.len() > MAX_ADDRESS_LEN {
        return Err(invalid(field, "email address too long"));
    }

    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| invalid(field, format!("invalid email address '{}'", address)))?;

    let local_ok = !local.is_empty()
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'));

    let labels: Vec<&str> = domain.split('.').collect();
    let domain_ok = labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
        && labels
            .last()
            .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));

    if !local_ok || !domain_ok {
        return Err(invalid(field, format!("invalid email address '{}'", address)));
    }

    Ok(())
}

pub fn validate_addresses(field: &str, addresses: &[String]) -> Result<(), EmailServiceError> {
    for (i, address) in addresses.iter().enumerate() {
        validate_email_address(&format!("{}[{}]", field, i), address)?;
    }
    Ok(())
}

pub fn validate_subject(subject: &str) -> Result<(), EmailServiceError> {
    if subject.trim().is_empty() {
        return Err(invalid("subject", "subject cannot be empty"));
    }
    if subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(invalid("subject", "subject cannot exceed 255 characters"));
    }
    if subject.contains(['\r', '\n']) {
        return Err(invalid("subject", "subject cannot contain line breaks"));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> Result<(), EmailServiceError> {
    if body.trim().is_empty() {
        return Err(invalid("body", "body cannot be empty"));
    }
    Ok(())
}

/// `type/subtype` made of RFC 2045 token characters.
pub fn is_mime_type(value: &str) -> bool {
    let is_token = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
    };

    value
        .split_once('/')
        .is_some_and(|(kind, subtype)| is_token(kind) && is_token(subtype))
}

pub fn validate_attachment_filename(field: &str, filename: &str) -> Result<(), EmailServiceError> {
    if filename.trim().is_empty() {
        return Err(invalid(field, "filename cannot be empty"));
    }
    if filename.contains(['\r', '\n', '"', '\\', '/']) {
        return Err(invalid(field, "filename contains invalid characters"));
    }
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();

    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_template_name(name: &str) -> Result<(), EmailServiceError> {
    if name.trim().is_empty() {
        return Err(EmailServiceError::InvalidTemplate(
            "template name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_TEMPLATE_NAME_LEN {
        return Err(EmailServiceError::InvalidTemplate(
            "template name cannot exceed 255 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EmailServiceError::InvalidTemplate(
            "template name can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        ));
    }
    Ok(())
}
