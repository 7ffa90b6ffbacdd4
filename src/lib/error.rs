use actix_web::{http::StatusCode, Error as ActixWebError, HttpResponse, ResponseError};
use actix_web_actors::ws::ProtocolError;
use jsonwebtoken::errors::Error as JwtError;
use serde::Serialize;
use serde_json::Value;
use sqlx_core::Error as SqlxError;
use std::fmt::{Display, Error as FmtError, Formatter};

/// Global server error type. External library errors are folded into
/// `Internal` so every handler answers the wire shape demanded by the
/// HTTP surface: `{ code, message, details }`.
#[derive(Debug)]
pub enum ServerError {
    Domain(Code, String, Option<Value>),
    Internal(String),
}

/// The closed error taxonomy. Every domain precondition violation maps to
/// exactly one of these; row-count mismatches and unexpected driver
/// failures are `ServerError::Internal` and always answer 500.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Code {
    Unauthorized,
    NotHost,
    CannotAccessChat,
    UserNotFound,
    WorldNotFound,
    GameNotFound,
    PlayerNotFound,
    ChatNotFound,
    MessageNotFound,
    GameFull,
    GameAlreadyStarted,
    GameNotFinished,
    PlayerNotReady,
    PlayerNotInGame,
    CharacterNotReady,
    GameNewHostNotFound,
    GameMaxPlayersTooSmall,
    MutuallyExclusiveOptions,
    InvalidProvider,
    ServerError,
}

impl Code {
    pub const fn status(self) -> StatusCode {
        use Code::*;
        match self {
            Unauthorized | NotHost | CannotAccessChat => StatusCode::UNAUTHORIZED,
            UserNotFound | WorldNotFound | GameNotFound | PlayerNotFound | ChatNotFound
            | MessageNotFound => StatusCode::NOT_FOUND,
            GameFull => StatusCode::CONFLICT,
            GameAlreadyStarted | GameNotFinished | PlayerNotReady | PlayerNotInGame
            | CharacterNotReady | GameNewHostNotFound | GameMaxPlayersTooSmall
            | MutuallyExclusiveOptions | InvalidProvider => StatusCode::BAD_REQUEST,
            ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ServerError {
    pub fn domain(code: Code, message: impl Into<String>) -> Self {
        Self::Domain(code, message.into(), None)
    }

    pub fn with_details(code: Code, message: impl Into<String>, details: Value) -> Self {
        Self::Domain(code, message.into(), Some(details))
    }

    /// Turns a `sqlx::Error::RowNotFound` into the given not-found code; any
    /// other driver error is a bug in the server, not a domain condition.
    pub fn not_found_or_server_error(code: Code) -> impl FnOnce(SqlxError) -> Self {
        move |err| match err {
            SqlxError::RowNotFound => Self::domain(code, "not found"),
            other => Self::Internal(other.to_string()),
        }
    }

    /// An expected `RETURNING` row went missing after a mutation: always a
    /// bug in the server's view of the row, never a domain error.
    pub fn row_count_mismatch(context: &str) -> Self {
        Self::Internal(format!("row count mismatch: {}", context))
    }

    /// Checks a mutation's affected-row count against the single row every
    /// `update`/`remove` call in this crate expects to touch.
    pub fn expect_one_row(affected: u64, context: &str) -> std::result::Result<(), Self> {
        if affected == 1 {
            Ok(())
        } else {
            Err(Self::row_count_mismatch(context))
        }
    }
}

impl From<ActixWebError> for ServerError {
    fn from(error: ActixWebError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<JwtError> for ServerError {
    fn from(error: JwtError) -> Self {
        Self::domain(Code::Unauthorized, error.to_string())
    }
}

impl From<ProtocolError> for ServerError {
    fn from(error: ProtocolError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<actix::MailboxError> for ServerError {
    fn from(error: actix::MailboxError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<SqlxError> for ServerError {
    fn from(error: SqlxError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for ServerError {}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: Code,
    message: &'a str,
    details: &'a Option<Value>,
}

impl ResponseError for ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Domain(code, ..) => code.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        log::error!("{}", self);
        match self {
            Self::Domain(code, message, details) => {
                HttpResponse::build(self.status_code()).json(ErrorBody {
                    code: *code,
                    message,
                    details,
                })
            }
            Self::Internal(message) => HttpResponse::build(self.status_code()).json(ErrorBody {
                code: Code::ServerError,
                message,
                details: &None,
            }),
        }
    }
}

/// Implemented by row-mapped entities so "not found" lookups can be
/// written generically (mirrors the teacher's `Entity`/`ETYPE` trait).
pub trait Entity {
    const ETYPE: &'static str;
    const NOT_FOUND: Code;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes_map_to_404() {
        for code in [Code::UserNotFound, Code::WorldNotFound, Code::GameNotFound, Code::PlayerNotFound, Code::ChatNotFound, Code::MessageNotFound] {
            assert_eq!(code.status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn unauthorized_codes_map_to_401() {
        for code in [Code::Unauthorized, Code::NotHost, Code::CannotAccessChat] {
            assert_eq!(code.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn game_full_maps_to_409() {
        assert_eq!(Code::GameFull.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn row_not_found_becomes_the_given_domain_code() {
        let err = ServerError::not_found_or_server_error(Code::WorldNotFound)(SqlxError::RowNotFound);
        assert!(matches!(err, ServerError::Domain(Code::WorldNotFound, ..)));
    }

    #[test]
    fn expect_one_row_passes_through_a_single_affected_row() {
        assert!(ServerError::expect_one_row(1, "test").is_ok());
    }

    #[test]
    fn expect_one_row_rejects_zero_or_many() {
        assert!(matches!(ServerError::expect_one_row(0, "test"), Err(ServerError::Internal(_))));
        assert!(matches!(ServerError::expect_one_row(2, "test"), Err(ServerError::Internal(_))));
    }
}
