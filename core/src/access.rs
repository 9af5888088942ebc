use serde::Serialize;

use crate::models::{AccountStatus, Role};

/// What an access code entitles a new account to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub status: AccountStatus,
    pub role: Role,
}

const ACCESS_CODES: &[(&str, AccessGrant)] = &[
    (
        "MASTER_KEY",
        AccessGrant {
            status: AccountStatus::Active,
            role: Role::User,
        },
    ),
    (
        "FREE_TRIAL",
        AccessGrant {
            status: AccountStatus::Trial,
            role: Role::User,
        },
    ),
    (
        "OWNER_ACCESS",
        AccessGrant {
            status: AccountStatus::Active,
            role: Role::Owner,
        },
    ),
];

/// Static lookup; codes are matched trimmed and case-insensitively.
#[must_use]
pub fn lookup_access_code(code: &str) -> Option<AccessGrant> {
    let code = code.trim();
    ACCESS_CODES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, grant)| *grant)
}
