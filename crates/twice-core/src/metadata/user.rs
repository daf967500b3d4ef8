//! Display-name parsing for participants.
//!
//! Users are identified by free-form strings such as
//! `"Bob Smith <bob.smith@example.com>"` or a bare `"bob@example.com"`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The string has no email address in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot parse as user: {0}")]
pub struct InvalidUser(pub String);

/// A participant: optional display name plus email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub email: String,
}

impl User {
    /// Parse `"Name <email>"` or a bare email.
    ///
    /// In the angle form an empty name falls back to the local part of the
    /// address. Anything else containing `@` is taken as a bare email with
    /// no name.
    pub fn parse(s: &str) -> Result<Self, InvalidUser> {
        if !s.contains('@') {
            return Err(InvalidUser(s.to_string()));
        }

        if let Some(user) = parse_angle_form(s) {
            return Ok(user);
        }

        Ok(Self {
            name: String::new(),
            email: s.trim().to_string(),
        })
    }

    /// Name if there is one, otherwise the email.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }

    /// Lowercased email, the identity used for matching.
    #[must_use]
    pub fn email_key(&self) -> String {
        self.email.to_lowercase()
    }

    /// Same person, by case-insensitive email.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        self.email_key() == other.email_key()
    }
}

impl FromStr for User {
    type Err = InvalidUser;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.email)
        } else {
            write!(f, "{} <{}>", self.name, self.email)
        }
    }
}

/// Lowercased email of a stored display string, falling back to the whole
/// trimmed string when it does not parse.
#[must_use]
pub fn email_key(display: &str) -> String {
    User::parse(display).map_or_else(|_| display.trim().to_lowercase(), |u| u.email_key())
}

fn parse_angle_form(s: &str) -> Option<User> {
    let trimmed = s.trim_end();
    let inner_end = trimmed.strip_suffix('>')?;
    let open = inner_end.find('<')?;

    let email = inner_end[open + 1..].trim();
    if email.chars().count() < 2 {
        return None;
    }

    let mut name = inner_end[..open].trim().to_string();
    if name.is_empty() {
        name = email.split('@').next().unwrap_or_default().trim().to_string();
    }

    Some(User {
        name,
        email: email.to_string(),
    })
}
