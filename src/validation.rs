//! Form field validation and normalization
//!
//! Failures are `ValidationError`s: the dialogue re-prompts and stays where
//! it is.

use crate::ids::UserId;
use crate::state_machine::state::PersonalField;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

pub const DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M";

const MAX_FIELD_LEN: usize = 100;
const MAX_PLATE_LEN: usize = 16;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{L}][\p{L} '\-]*$").expect("valid name regex")
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@([A-Za-z0-9\-]+\.)+[A-Za-z]{2,}$").expect("valid email regex")
});
static ZIPCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{6}$").expect("valid zipcode regex"));
static PLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\d\- ]+$").expect("valid plate regex"));

/// Throwaway mailbox providers; complaints sent from these are rejected by
/// the portal
const DISPOSABLE_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "guerrillamail.com",
    "mailinator.com",
    "maildrop.cc",
    "sharklasers.com",
    "temp-mail.org",
    "tempmail.com",
    "throwawaymail.com",
    "trashmail.com",
    "yopmail.com",
];

const LATIN_LOOKALIKES: [(char, char); 13] = [
    ('A', 'А'),
    ('B', 'В'),
    ('C', 'С'),
    ('E', 'Е'),
    ('H', 'Н'),
    ('K', 'К'),
    ('M', 'М'),
    ('O', 'О'),
    ('P', 'Р'),
    ('T', 'Т'),
    ('X', 'Х'),
    ('Y', 'У'),
    ('I', 'І'),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("the {field} must not be empty")]
    Empty { field: &'static str },
    #[error("the {field} is too long")]
    TooLong { field: &'static str },
    #[error("the {field} may only contain letters, spaces, hyphens and apostrophes")]
    InvalidName { field: &'static str },
    #[error("this does not look like an email address")]
    InvalidEmail,
    #[error("disposable email addresses are not accepted")]
    DisposableEmail,
    #[error("the zipcode must be six digits")]
    InvalidZipcode,
    #[error("the registration number may only contain letters, digits and hyphens")]
    InvalidPlate,
    #[error("the date and time must look like 31.12.2024 18:30")]
    InvalidDateTime,
    #[error("expected a numeric user id")]
    InvalidUserId,
}

fn non_empty(text: &str, field: &'static str, max: usize) -> Result<String, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if text.chars().count() > max {
        return Err(ValidationError::TooLong { field });
    }
    Ok(text.to_string())
}

/// Validate one registration answer, returning the trimmed value
pub fn personal_field(field: PersonalField, text: &str) -> Result<String, ValidationError> {
    let label = field.label();
    let value = non_empty(text, label, MAX_FIELD_LEN)?;
    match field {
        PersonalField::FirstName | PersonalField::Patronymic | PersonalField::LastName => {
            if !NAME_RE.is_match(&value) {
                return Err(ValidationError::InvalidName { field: label });
            }
        }
        PersonalField::Zipcode => {
            if !ZIPCODE_RE.is_match(&value) {
                return Err(ValidationError::InvalidZipcode);
            }
        }
        PersonalField::City
        | PersonalField::Street
        | PersonalField::House
        | PersonalField::Block
        | PersonalField::Flat => {}
    }
    Ok(value)
}

pub fn email(text: &str) -> Result<String, ValidationError> {
    let value = non_empty(text, "email", MAX_FIELD_LEN)?.to_lowercase();
    if !EMAIL_RE.is_match(&value) {
        return Err(ValidationError::InvalidEmail);
    }
    let domain = value.rsplit('@').next().unwrap_or_default();
    if DISPOSABLE_DOMAINS.contains(&domain) {
        return Err(ValidationError::DisposableEmail);
    }
    Ok(value)
}

/// Upper-case, trim and replace Latin letters that look like Cyrillic ones
pub fn normalize_plate(text: &str) -> String {
    text.trim()
        .to_uppercase()
        .chars()
        .map(|c| {
            LATIN_LOOKALIKES
                .iter()
                .find(|(latin, _)| *latin == c)
                .map_or(c, |(_, cyrillic)| *cyrillic)
        })
        .collect()
}

pub fn plate(text: &str) -> Result<String, ValidationError> {
    let value = normalize_plate(&non_empty(text, "registration number", MAX_PLATE_LEN)?);
    if !PLATE_RE.is_match(&value) {
        return Err(ValidationError::InvalidPlate);
    }
    Ok(value)
}

/// Accept `dd.mm.YYYY HH:MM`, returning it re-formatted canonically
pub fn violation_datetime(text: &str) -> Result<String, ValidationError> {
    let parsed = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
        .map_err(|_| ValidationError::InvalidDateTime)?;
    Ok(parsed.format(DATETIME_FORMAT).to_string())
}

/// Local wall-clock time at the given UTC offset, in the violation format
pub fn format_local_time(now: DateTime<Utc>, utc_offset_hours: i32) -> String {
    match FixedOffset::east_opt(utc_offset_hours * 3600) {
        Some(offset) => now.with_timezone(&offset).format(DATETIME_FORMAT).to_string(),
        None => now.format(DATETIME_FORMAT).to_string(),
    }
}

pub fn user_id(text: &str) -> Result<UserId, ValidationError> {
    text.trim()
        .parse()
        .map_err(|_| ValidationError::InvalidUserId)
}

/// Split `<user id> <reason>` of the ban command
pub fn ban_args(args: &str) -> Result<(UserId, String), ValidationError> {
    let args = args.trim();
    let (id, reason) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
    let user_id = user_id(id)?;
    let reason = non_empty(reason, "reason", MAX_FIELD_LEN)?;
    Ok((user_id, reason))
}
