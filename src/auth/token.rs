use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Token;

const ARGON2_MEMORY: u32 = 64 * 1024; // 64MB
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

const TOKEN_PREFIX: &str = "workbench";
const LOOKUP_LENGTH: usize = 8;
const SECRET_LENGTH: usize = 24;
const SECRET_BYTES: usize = 12;
const MAX_LOOKUP_ATTEMPTS: usize = 3;

pub struct TokenGenerator {
    argon2: Argon2<'static>,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .unwrap_or_default();

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Generates a new token with the format: workbench_<lookup>_<secret>
    /// Returns (raw_token, lookup, hash)
    pub fn generate(&self) -> Result<(String, String, String)> {
        let lookup = generate_lookup();
        let secret = generate_secret();
        let raw_token = build_token(&lookup, &secret);
        let hash = self.hash(&raw_token)?;
        Ok((raw_token, lookup, hash))
    }

    /// Hashes a raw token using Argon2id
    pub fn hash(&self, token: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(token.as_bytes(), &salt)
            .map_err(|e| Error::Config(format!("failed to hash token: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verifies a raw token against a stored hash
    pub fn verify(&self, token: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| Error::Config(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(token.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Config(format!("failed to verify token: {e}"))),
        }
    }

    /// Creates and persists a token, retrying on lookup collisions.
    /// Returns the raw token (shown once) and the stored record.
    pub fn issue(
        &self,
        store: &dyn Store,
        is_admin: bool,
        user_id: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(String, Token)> {
        for _ in 0..MAX_LOOKUP_ATTEMPTS {
            let (raw_token, lookup, hash) = self.generate()?;
            let token = Token {
                id: uuid::Uuid::new_v4().to_string(),
                token_hash: hash,
                token_lookup: lookup,
                is_admin,
                user_id: user_id.map(str::to_string),
                created_at: Utc::now(),
                expires_at,
                last_used_at: None,
            };

            match store.create_token(&token) {
                Ok(()) => return Ok((raw_token, token)),
                Err(Error::TokenLookupCollision) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::TokenLookupCollision)
    }
}

/// Generates the lookup portion of the token (first 8 chars of a UUID)
#[must_use]
fn generate_lookup() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.to_string()[..LOOKUP_LENGTH].to_string()
}

#[must_use]
fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)[..SECRET_LENGTH].to_string()
}

#[must_use]
fn build_token(lookup: &str, secret: &str) -> String {
    format!("{TOKEN_PREFIX}_{lookup}_{secret}")
}

/// Parses a token string into its components (lookup, secret)
pub fn parse_token(token: &str) -> Result<(String, String)> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or(Error::InvalidTokenFormat)?;

    let (lookup, secret) = rest.split_once('_').ok_or(Error::InvalidTokenFormat)?;

    if lookup.len() != LOOKUP_LENGTH || secret.len() != SECRET_LENGTH || secret.contains('_') {
        return Err(Error::InvalidTokenFormat);
    }

    Ok((lookup.to_string(), secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    #[test]
    fn test_token_generation_format() {
        let generator = TokenGenerator::new();
        let (token, lookup, _hash) = generator.generate().unwrap();

        assert!(token.starts_with("workbench_"));
        assert_eq!(lookup.len(), 8);

        let (parsed_lookup, secret) = parse_token(&token).unwrap();
        assert_eq!(parsed_lookup, lookup);
        assert_eq!(secret.len(), 24);
    }

    #[test]
    fn test_token_verification() {
        let generator = TokenGenerator::new();
        let (token, _, hash) = generator.generate().unwrap();

        assert!(generator.verify(&token, &hash).unwrap());

        let wrong_token = format!("{}00000", &token[..token.len() - 5]);
        assert!(!generator.verify(&wrong_token, &hash).unwrap());
    }

    #[test]
    fn test_parse_token_rejects_malformed() {
        assert!(parse_token("workbench_12345678_123456789012345678901234").is_ok());
        assert!(parse_token("cutlass_12345678_123456789012345678901234").is_err());
        assert!(parse_token("workbench_12345678").is_err());
        assert!(parse_token("workbench_1234_123456789012345678901234").is_err());
        assert!(parse_token("workbenchx12345678_123456789012345678901234").is_err());
    }

    #[test]
    fn test_hash_is_phc_format() {
        let generator = TokenGenerator::new();
        let (_, _, hash) = generator.generate().unwrap();

        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn test_issue_persists_token() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let generator = TokenGenerator::new();
        let (raw, token) = generator.issue(&store, true, None, None).unwrap();

        let (lookup, _) = parse_token(&raw).unwrap();
        let stored = store.get_token_by_lookup(&lookup).unwrap().unwrap();
        assert_eq!(stored.id, token.id);
        assert!(stored.is_admin);
        assert!(generator.verify(&raw, &stored.token_hash).unwrap());
        assert!(store.has_admin_token().unwrap());
    }
}
