use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Who is on the other end of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    User { user_id: String, role: Role },
}

impl Identity {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User { user_id, .. } => Some(user_id),
            Identity::Anonymous => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Identity::User {
                role: Role::Admin,
                ..
            }
        )
    }
}
