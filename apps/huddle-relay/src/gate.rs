use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decides whether a websocket upgrade may proceed.
#[derive(Clone)]
pub enum AdmissionGate {
    /// Every connection is admitted.
    Open,
    /// `?token=` must be an unexpired HS256 JWT signed with the shared secret.
    SharedSecret {
        key: DecodingKey,
        validation: Validation,
    },
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("token missing")]
    MissingToken,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
}

impl GateError {
    pub fn reason(&self) -> &'static str {
        match self {
            GateError::MissingToken => "missing",
            GateError::InvalidToken(_) => "invalid",
            GateError::MissingSubject => "missing_subject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// Who was let in. `subject` is `None` when the gate is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub subject: Option<String>,
}

impl AdmissionGate {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.set_required_spec_claims(&["exp", "sub"]);
                validation.leeway = 5;
                AdmissionGate::SharedSecret {
                    key: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                }
            }
            None => AdmissionGate::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, AdmissionGate::Open)
    }

    pub fn admit(&self, token: Option<&str>) -> Result<Admission, GateError> {
        match self {
            AdmissionGate::Open => Ok(Admission { subject: None }),
            AdmissionGate::SharedSecret { key, validation } => {
                let token = token
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .ok_or(GateError::MissingToken)?;
                let data = decode::<Claims>(token, key, validation)?;
                if data.claims.sub.trim().is_empty() {
                    return Err(GateError::MissingSubject);
                }
                Ok(Admission {
                    subject: Some(data.claims.sub),
                })
            }
        }
    }
}
