use super::models::{AuthUser, Claims};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("JWT decoding error: {0}")]
    Decoding(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn generate_token(&self, user: &AuthUser) -> Result<String, JwtError> {
        self.generate_token_valid_for(user, Duration::hours(24))
    }

    pub fn generate_token_valid_for(
        &self,
        user: &AuthUser,
        lifetime: Duration,
    ) -> Result<String, JwtError> {
        let now = Utc::now();
        let expiration = now + lifetime;

        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            exp: expiration.timestamp().max(0) as usize,
            iat: now.timestamp() as usize,
        };

        let header = Header::new(Algorithm::HS256);
        encode(&header, &claims, &self.encoding_key).map_err(JwtError::Encoding)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, JwtError> {
        if token.is_empty() || token.split('.').count() != 3 {
            return Err(JwtError::InvalidToken);
        }

        let validation = Validation::new(Algorithm::HS256);

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(token_data) => {
                let now = Utc::now().timestamp() as usize;
                if token_data.claims.exp < now {
                    log::warn!(
                        "JWT token expired. Exp: {}, Now: {}",
                        token_data.claims.exp,
                        now
                    );
                    return Err(JwtError::TokenExpired);
                }
                Ok(token_data.claims)
            }
            Err(err) => {
                log::debug!("JWT token decode error: {:?}", err);
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        Err(JwtError::TokenExpired)
                    }
                    jsonwebtoken::errors::ErrorKind::InvalidToken
                    | jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        Err(JwtError::InvalidToken)
                    }
                    _ => Err(JwtError::Decoding(err.to_string())),
                }
            }
        }
    }
}
