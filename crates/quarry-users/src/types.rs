use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, UserError};

/// Userdata key holding the moment the account is to be deleted.
pub const DELETE_AFTER: &str = "delete-after";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub is_admin: bool,
    /// Free-form per-user settings.
    pub userdata: Map<String, Value>,
    pub registered_at: i64,
}

impl User {
    /// The raw `delete-after` setting, if any. Numbers are rendered as their
    /// decimal text.
    pub fn delete_after_raw(&self) -> Option<String> {
        match self.userdata.get(DELETE_AFTER)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Parsed `delete-after`. `None` when unset.
    pub fn delete_after(&self) -> Option<Result<DeleteAfter>> {
        self.delete_after_raw().map(|raw| DeleteAfter::parse(&raw))
    }
}

/// When an account expires, as unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeleteAfter(i64);

impl DeleteAfter {
    /// Accepts a calendar date (`2024-05-01`, midnight UTC) or a unix
    /// timestamp made of digits only.
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<i64>()
                .map(DeleteAfter)
                .map_err(|_| UserError::InvalidExpiry(raw.to_string()));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| DeleteAfter(dt.and_utc().timestamp()))
            .ok_or_else(|| UserError::InvalidExpiry(raw.to_string()))
    }

    pub fn timestamp(self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_dates_and_timestamps() {
        assert_eq!(DeleteAfter::parse("1970-01-02").unwrap().timestamp(), 86_400);
        assert_eq!(DeleteAfter::parse("2024-03-01").unwrap().timestamp(), 1_709_251_200);
        assert_eq!(DeleteAfter::parse(" 1709251200 ").unwrap().timestamp(), 1_709_251_200);
    }

    #[test]
    fn rejects_everything_else() {
        for bad in ["not-a-date", "", "2024-13-01", "2024/03/01", "-5", "1.5", "99999999999999999999"] {
            assert!(
                matches!(DeleteAfter::parse(bad), Err(UserError::InvalidExpiry(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn delete_after_from_userdata() {
        let mut user = User {
            name: "alice".into(),
            is_admin: false,
            userdata: Map::new(),
            registered_at: 0,
        };
        assert!(user.delete_after().is_none());

        user.userdata.insert(DELETE_AFTER.into(), json!(86_400));
        assert_eq!(user.delete_after().unwrap().unwrap().timestamp(), 86_400);

        user.userdata.insert(DELETE_AFTER.into(), json!("soon"));
        assert!(user.delete_after().unwrap().is_err());

        user.userdata.insert(DELETE_AFTER.into(), json!(""));
        assert!(user.delete_after().is_none());
    }
}
