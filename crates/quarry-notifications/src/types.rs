use serde::{Deserialize, Serialize};

const ADMINS: &str = "!admins";
const EVERYONE: &str = "!everyone";

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Recipient {
    /// A single user, by name.
    User(String),
    /// Every admin user.
    Admins,
    /// Every user.
    Everyone,
}

impl Recipient {
    pub fn user(name: &str) -> Self {
        Recipient::User(name.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        !matches!(self, Recipient::User(_))
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::User(name) => write!(f, "{name}"),
            Recipient::Admins => write!(f, "{ADMINS}"),
            Recipient::Everyone => write!(f, "{EVERYONE}"),
        }
    }
}

impl std::str::FromStr for Recipient {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            ADMINS => Ok(Recipient::Admins),
            EVERYONE => Ok(Recipient::Everyone),
            "" => Err("empty recipient".to_string()),
            other if other.starts_with('!') => Err(format!("unknown broadcast recipient: {other}")),
            name => Ok(Recipient::User(name.to_string())),
        }
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for Recipient {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipient: Recipient,
    pub message: String,
    pub dismissible: bool,
    pub created_at: i64,
    /// Unix seconds after which the notification is removed.
    pub expires_at: Option<i64>,
}
