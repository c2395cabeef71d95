//! Admin authentication: a single salted-hash admin password exchanged for
//! a short-lived HS256 bearer token.
//!
//! The password file (`.admin_password`, mode 0600) holds one line
//! `<salt>$<sha256hex>`. Priority on first load: `ADMIN_PASSWORD` env var >
//! existing file > built-in default (`"admin"`, written out on first run).
//! Tokens are minted and verified against a JWT secret (`JWT_SECRET` env
//! var, else generated once per process) with no external JWT crate —
//! just `hmac` + `sha2` + `base64`.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_PASSWORD: &str = "admin";
const TOKEN_TTL_SECS: i64 = 30 * 60;
const ISSUER: &str = "auth_server";
const SUBJECT: &str = "admin";

pub enum Credential {
    Basic(String),
    Bearer(String),
}

pub struct AdminAuth {
    password_file: PathBuf,
    password_hash: String,
    jwt_secret: String,
}

impl AdminAuth {
    /// Load (or create) the admin password file at `password_file`.
    pub fn load(password_file: impl Into<PathBuf>) -> Result<Self> {
        let password_file = password_file.into();
        let jwt_secret = load_or_generate_jwt_secret();

        let password_hash = if let Ok(env_pass) = std::env::var("ADMIN_PASSWORD") {
            let (salt, hash) = hash_with_new_salt(&env_pass);
            tracing::info!("using admin password from ADMIN_PASSWORD environment variable");
            format!("{salt}${hash}")
        } else if password_file.exists() {
            std::fs::read_to_string(&password_file)
                .with_context(|| format!("failed to read {}", password_file.display()))?
                .trim()
                .to_string()
        } else {
            let (salt, hash) = hash_with_new_salt(DEFAULT_PASSWORD);
            let line = format!("{salt}${hash}");
            write_password_file(&password_file, &line)?;
            line
        };

        Ok(Self {
            password_file,
            password_hash,
            jwt_secret,
        })
    }

    /// Verify a credential and, for `Basic`, mint a fresh bearer token.
    /// Returns the token to hand back to the caller on success (`Bearer`
    /// verification returns an empty string — there is nothing new to
    /// issue).
    pub fn authenticate(&self, credential: &Credential) -> Result<String> {
        match credential {
            Credential::Basic(password) => {
                let salt = self.salt();
                let candidate = hash_with_salt(salt, password);
                if candidate != self.stored_hash() {
                    bail!("invalid credentials");
                }
                self.mint_token()
            }
            Credential::Bearer(token) => {
                self.verify_token(token)?;
                Ok(String::new())
            }
        }
    }

    pub fn is_default_password(&self) -> bool {
        let salt = self.salt();
        hash_with_salt(salt, DEFAULT_PASSWORD) == self.stored_hash()
    }

    pub fn set_password(&mut self, new_password: &str) -> Result<()> {
        let (salt, hash) = hash_with_new_salt(new_password);
        let line = format!("{salt}${hash}");
        write_password_file(&self.password_file, &line)?;
        self.password_hash = line;
        Ok(())
    }

    fn salt(&self) -> &str {
        self.password_hash.split('$').next().unwrap_or("")
    }

    fn stored_hash(&self) -> &str {
        self.password_hash.split('$').nth(1).unwrap_or("")
    }

    fn mint_token(&self) -> Result<String> {
        let now = now_secs();
        let header = base64url_json(&serde_json::json!({ "alg": "HS256", "typ": "JWT" }));
        let payload = base64url_json(&serde_json::json!({
            "iss": ISSUER,
            "sub": SUBJECT,
            "iat": now,
            "exp": now + TOKEN_TTL_SECS,
        }));
        let signing_input = format!("{header}.{payload}");
        let signature = self.sign(&signing_input);
        Ok(format!("{signing_input}.{signature}"))
    }

    fn verify_token(&self, token: &str) -> Result<()> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature)) = (parts.next(), parts.next(), parts.next()) else {
            bail!("malformed token");
        };
        if parts.next().is_some() {
            bail!("malformed token");
        }

        let signing_input = format!("{header}.{payload}");
        let expected = self.sign(&signing_input);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            bail!("invalid token signature");
        }

        let payload_bytes = URL_SAFE_NO_PAD.decode(payload).context("invalid token payload encoding")?;
        let claims: serde_json::Value = serde_json::from_slice(&payload_bytes).context("invalid token payload json")?;

        if claims.get("iss").and_then(|v| v.as_str()) != Some(ISSUER) {
            bail!("unexpected token issuer");
        }
        let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
        if now_secs() >= exp {
            bail!("token expired");
        }

        Ok(())
    }

    fn sign(&self, data: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.jwt_secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(data.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn hash_with_new_salt(password: &str) -> (String, String) {
    let salt = random_alphanumeric(12);
    (salt.clone(), hash_with_salt(&salt, password))
}

fn hash_with_salt(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_alphanumeric(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

fn load_or_generate_jwt_secret() -> String {
    if let Ok(secret) = std::env::var("JWT_SECRET") {
        return secret;
    }
    random_alphanumeric(32)
}

fn write_password_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn base64url_json(value: &serde_json::Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).expect("json serialization cannot fail for a Value"))
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_password_is_detected_on_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".admin_password");
        let auth = AdminAuth::load(&path).unwrap();
        assert!(auth.is_default_password());
    }

    #[test]
    fn basic_auth_with_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".admin_password");
        let auth = AdminAuth::load(&path).unwrap();
        let result = auth.authenticate(&Credential::Basic("wrong".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn basic_auth_round_trips_into_a_verifiable_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".admin_password");
        let auth = AdminAuth::load(&path).unwrap();

        let token = auth.authenticate(&Credential::Basic(DEFAULT_PASSWORD.to_string())).unwrap();
        assert!(!token.is_empty());
        assert!(auth.authenticate(&Credential::Bearer(token)).is_ok());
    }

    #[test]
    fn set_password_changes_default_detection_and_old_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".admin_password");
        let mut auth = AdminAuth::load(&path).unwrap();
        auth.set_password("correct horse battery staple").unwrap();

        assert!(!auth.is_default_password());
        assert!(auth.authenticate(&Credential::Basic(DEFAULT_PASSWORD.to_string())).is_err());
        assert!(auth
            .authenticate(&Credential::Basic("correct horse battery staple".to_string()))
            .is_ok());
    }

    #[test]
    fn tampered_token_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".admin_password");
        let auth = AdminAuth::load(&path).unwrap();
        let mut token = auth.authenticate(&Credential::Basic(DEFAULT_PASSWORD.to_string())).unwrap();
        token.push('x');
        assert!(auth.authenticate(&Credential::Bearer(token)).is_err());
    }
}
