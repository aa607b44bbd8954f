use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fs;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::Role;

/// RS256 signer and verifier for access and refresh tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Account ID
    pub sub: String,
    /// Role at the time the token was minted
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    /// JWT ID (for blacklisting on logout)
    pub jti: String,
    /// Session epoch at issuance
    pub sep: i64,
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub sub: String,
    /// Refresh session ID (matches the stored record)
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub sep: i64,
}

/// Token pair returned to the client
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

impl JwtService {
    /// Load RSA keys from the PEM files named in the config
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        Self::from_pem(
            &private_key_pem,
            &public_key_pem,
            config.access_token_expiry_minutes,
            config.refresh_token_expiry_days,
        )
    }

    pub fn from_pem(
        private_key_pem: &str,
        public_key_pem: &str,
        access_token_expiry_minutes: i64,
        refresh_token_expiry_days: i64,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        tracing::info!("JWT service initialized with RS256 keys");

        Ok(Self {
            encoding_key,
            decoding_key,
            access_token_expiry_minutes,
            refresh_token_expiry_days,
        })
    }

    pub fn generate_access_token(
        &self,
        account_id: Uuid,
        role: Role,
        session_epoch: i64,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: account_id.to_string(),
            role,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
            sep: session_epoch,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))
    }

    pub fn generate_refresh_token(
        &self,
        account_id: Uuid,
        session_id: Uuid,
        session_epoch: i64,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::days(self.refresh_token_expiry_days);

        let claims = RefreshTokenClaims {
            sub: account_id.to_string(),
            jti: session_id.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            sep: session_epoch,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode refresh token: {}", e))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;

        let token_data = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid access token: {}", e))?;

        Ok(token_data.claims)
    }

    pub fn validate_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenClaims, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;

        let token_data = decode::<RefreshTokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid refresh token: {}", e))?;

        Ok(token_data.claims)
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_days(&self) -> i64 {
        self.refresh_token_expiry_days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/jwt_private.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/jwt_public.pem");

    fn service() -> JwtService {
        JwtService::from_pem(PRIVATE_KEY, PUBLIC_KEY, 15, 7).unwrap()
    }

    #[test]
    fn test_jwt_service_loads_keys_from_files() -> Result<(), anyhow::Error> {
        let mut private_file = NamedTempFile::new()?;
        private_file.write_all(PRIVATE_KEY.as_bytes())?;
        let mut public_file = NamedTempFile::new()?;
        public_file.write_all(PUBLIC_KEY.as_bytes())?;

        let config = JwtConfig {
            private_key_path: private_file.path().to_string_lossy().to_string(),
            public_key_path: public_file.path().to_string_lossy().to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        };

        let service = JwtService::new(&config)?;
        assert_eq!(service.access_token_expiry_seconds(), 900);
        assert_eq!(service.refresh_token_expiry_days(), 7);
        Ok(())
    }

    #[test]
    fn test_missing_key_file_is_an_error() {
        let config = JwtConfig {
            private_key_path: "/nonexistent/private.pem".to_string(),
            public_key_path: "/nonexistent/public.pem".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        };
        assert!(JwtService::new(&config).is_err());
    }

    #[test]
    fn test_access_token_carries_role_and_epoch() -> Result<(), anyhow::Error> {
        let service = service();
        let account_id = Uuid::new_v4();

        let token = service.generate_access_token(account_id, Role::Doctor, 3)?;
        let claims = service.validate_access_token(&token)?;

        assert_eq!(claims.sub, account_id.to_string());
        assert_eq!(claims.role, Role::Doctor);
        assert_eq!(claims.sep, 3);
        assert!(claims.exp > claims.iat);
        Ok(())
    }

    #[test]
    fn test_refresh_token_carries_session_id() -> Result<(), anyhow::Error> {
        let service = service();
        let account_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = service.generate_refresh_token(account_id, session_id, 0)?;
        let claims = service.validate_refresh_token(&token)?;

        assert_eq!(claims.jti, session_id.to_string());
        assert_eq!(claims.sep, 0);
        Ok(())
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() -> Result<(), anyhow::Error> {
        let service = service();
        let token = service.generate_refresh_token(Uuid::new_v4(), Uuid::new_v4(), 0)?;
        assert!(service.validate_access_token(&token).is_err());
        Ok(())
    }

    #[test]
    fn test_tampered_token_is_rejected() -> Result<(), anyhow::Error> {
        let service = service();
        let token = service.generate_access_token(Uuid::new_v4(), Role::Patient, 0)?;
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(service.validate_access_token(&tampered).is_err());
        Ok(())
    }

    #[test]
    fn test_expired_token_is_rejected() -> Result<(), anyhow::Error> {
        // Negative lifetime puts exp beyond the default validation leeway.
        let service = JwtService::from_pem(PRIVATE_KEY, PUBLIC_KEY, -5, 7)?;
        let token = service.generate_access_token(Uuid::new_v4(), Role::Patient, 0)?;
        assert!(service.validate_access_token(&token).is_err());
        Ok(())
    }
}
