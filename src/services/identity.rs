//! Caller identity as handed over by the upstream gateway.
//!
//! Tokens are verified before a request reaches this service; all that is
//! left is reading the owner id out of whichever authorizer shape the
//! gateway forwarded. Shapes that match none of the known forms are
//! rejected rather than guessed at.

use serde::Deserialize;

/// Header carrying the gateway's authorizer context as JSON.
pub const AUTHORIZER_HEADER: &str = "x-authorizer-context";

#[derive(Debug, Deserialize)]
pub struct Claims {
    sub: Option<String>,
    #[serde(rename = "cognito:username")]
    username: Option<String>,
}

impl Claims {
    fn owner_id(&self) -> Option<&str> {
        self.sub
            .as_deref()
            .or(self.username.as_deref())
            .filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct JwtAuthorizer {
    claims: Claims,
}

/// The authorizer shapes the gateway is known to forward.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CallerIdentity {
    /// `{"jwt": {"claims": {...}}}` from a JWT authorizer.
    Jwt { jwt: JwtAuthorizer },
    /// `{"claims": {...}}` from a user-pool authorizer.
    UserPool { claims: Claims },
    /// `{"principalId": "..."}` (or `userId`) from a custom authorizer.
    Principal {
        #[serde(rename = "principalId", alias = "userId")]
        principal_id: String,
    },
}

impl CallerIdentity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        serde_json::from_str(raw).map_err(|_| IdentityError::UnknownShape)
    }

    pub fn owner_id(&self) -> Result<&str, IdentityError> {
        let id = match self {
            CallerIdentity::Jwt { jwt } => jwt.claims.owner_id(),
            CallerIdentity::UserPool { claims } => claims.owner_id(),
            CallerIdentity::Principal { principal_id } => {
                Some(principal_id.as_str()).filter(|id| !id.trim().is_empty())
            }
        };
        id.ok_or(IdentityError::MissingSubject)
    }
}

/// Parse an authorizer context and return the caller's owner id.
pub fn extract_owner_id(raw: &str) -> Result<String, IdentityError> {
    CallerIdentity::parse(raw)?.owner_id().map(str::to_string)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("authorizer context missing")]
    Missing,

    #[error("unrecognised authorizer context shape")]
    UnknownShape,

    #[error("authorizer context carries no user id")]
    MissingSubject,
}
