use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(Uuid),
    #[error("authentication failed")]
    AuthFailed,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("not subscribed to session")]
    NotSubscribed,
    #[error("connection limit exceeded for user")]
    ConnectionLimit,
    #[error("invalid message")]
    InvalidMessage,
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            HubError::AuthFailed => crate::protocol::error_codes::AUTH_FAILED,
            HubError::NotAuthenticated => crate::protocol::error_codes::NOT_AUTHENTICATED,
            HubError::NotSubscribed => crate::protocol::error_codes::NOT_SUBSCRIBED,
            HubError::ConnectionLimit => crate::protocol::error_codes::CONNECTION_LIMIT,
            HubError::InvalidMessage => crate::protocol::error_codes::INVALID_MESSAGE,
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
