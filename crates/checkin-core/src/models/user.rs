use serde::{Deserialize, Serialize};

/// Staff role. Ordering is privilege: `Viewer < Staff < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Viewer,
    Staff,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "VIEWER"),
            Role::Staff => write!(f, "STAFF"),
            Role::Admin => write!(f, "ADMIN"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "staff" => Ok(Role::Staff),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl User {
    /// Highest role held, if any.
    pub fn top_role(&self) -> Option<Role> {
        self.roles.iter().copied().max()
    }

    pub fn has_role(&self, min: Role) -> bool {
        has_role(&self.roles, min)
    }
}

pub fn has_role(roles: &[Role], min: Role) -> bool {
    roles.iter().any(|r| *r >= min)
}
