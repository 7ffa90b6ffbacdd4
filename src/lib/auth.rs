use crate::core::models::UserId;
use crate::lib::error::{Code, ServerError};
use actix_web::dev::Payload;
use actix_web::{Error, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by the bearer JWT. Only the user identity and the token
/// lifetime are part of the core's contract; OAuth issuance itself is an
/// external collaborator (spec.md §1).
#[derive(Serialize, Deserialize, Clone, Copy)]
pub struct Claims {
    pub user_id: UserId,
    pub exp: usize,
}

pub fn create_jwt(claims: Claims, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
}

/// Extracts the bearer token from the `Authentication`/`Authorization`
/// header or the `session` cookie, per spec.md §6's WebSocket/HTTP auth
/// rule. Missing or invalid credentials are `Code::Unauthorized`, never a
/// panic: the teacher's placeholder (`panic!("Not authorization header
/// found")`) is not an acceptable translation of that rule (see
/// SPEC_FULL.md §6), so this one behavior is corrected rather than copied.
fn bearer_token(req: &HttpRequest) -> Option<String> {
    if let Some(header) = req
        .headers()
        .get("Authorization")
        .or_else(|| req.headers().get("Authentication"))
    {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.split(' ').last() {
                return Some(token.to_owned());
            }
        }
    }
    req.cookie("session").map(|c| c.value().to_owned())
}

impl FromRequest for Claims {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;
    type Config = ();

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let secret = crate::core::state::state().config.jwt_secret.clone();

        let result = bearer_token(req)
            .ok_or_else(|| ServerError::domain(Code::Unauthorized, "no credentials supplied"))
            .and_then(|token| decode_jwt(&token, &secret).map_err(ServerError::from));

        ready(result.map_err(Error::from))
    }
}
