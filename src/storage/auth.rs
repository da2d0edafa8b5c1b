//! OAuth access tokens minted from a service-account key

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use super::sheets::Result;

const SCOPES: &str = "https://www.googleapis.com/auth/drive https://www.googleapis.com/auth/spreadsheets";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens this close to expiry are minted again
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The fields of a service-account key file this client needs
#[derive(Debug, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ServiceAccount {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Signed RS256 assertion exchanged for an access token
    pub fn assertion(&self, now: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let claims = Claims {
            iss: self.client_email.clone(),
            scope: SCOPES.to_string(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())?;
        Ok(encode(&header, &claims, &key)?)
    }
}

struct AccessToken {
    value: String,
    expires_at: i64,
}

/// Hands out a bearer token, minting a new one when the cached one runs out
pub struct TokenSource {
    account_file: PathBuf,
    agent: ureq::Agent,
    cached: RefCell<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(account_file: PathBuf, agent: ureq::Agent) -> Self {
        TokenSource {
            account_file,
            agent,
            cached: RefCell::new(None),
        }
    }

    pub fn bearer(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        if let Some(token) = self.cached.borrow().as_ref() {
            if token.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(format!("Bearer {}", token.value));
            }
        }

        let token = self.mint(now)?;
        let bearer = format!("Bearer {}", token.value);
        *self.cached.borrow_mut() = Some(token);
        Ok(bearer)
    }

    fn mint(&self, now: i64) -> Result<AccessToken> {
        let account = ServiceAccount::load(&self.account_file)?;
        let assertion = account.assertion(now)?;
        let response: TokenResponse = self
            .agent
            .post(&account.token_uri)
            .send_form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])?
            .into_json()?;
        info!("Minted access token for {}", account.client_email);
        Ok(AccessToken {
            value: response.access_token,
            expires_at: now + response.expires_in,
        })
    }
}
