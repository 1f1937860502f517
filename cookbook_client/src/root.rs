use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use reqwest::{header, multipart, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Config for the target cookbook API. `Default` pulls everything from env
/// so binaries can construct a client without hand-wiring.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        dotenv().ok();
        let base_url = std::env::var("NEW_API_BASE_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:8080/api/".into());
        let timeout_secs = std::env::var("API_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let retry_attempts = std::env::var("API_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let retry_base_delay_ms = std::env::var("API_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);
        Self {
            base_url,
            timeout_secs,
            retry_attempts,
            retry_base_delay_ms,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("authentication failed for {username}")]
    Auth { username: String },
}

/// Opaque bearer token for one authenticated session. Creation calls take
/// this explicitly, so "who performs the write" is always visible at the
/// call site instead of living in shared client state.
#[derive(Clone)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

// Tokens must never land in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("token", &"***").finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Creator,
    Admin,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUser {
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: String,
    pub roles: Vec<Role>,
}

// Payloads get logged on creation failure; keep the shared password out.
impl std::fmt::Debug for CreateUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateUser")
            .field("username", &self.username)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("password", &"***")
            .field("roles", &self.roles)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUnit {
    pub abbreviation: String,
    pub name: String,
    pub unit_category_id: i64,
    pub required: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeIngredient {
    pub name: Option<String>,
    pub value: Option<f64>,
    pub sort_number: i32,
    pub unit_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeSection {
    pub name: Option<String>,
    pub method: Option<String>,
    pub sort_number: i32,
    pub ingredients: Vec<RecipeIngredient>,
}

/// Reference to an already-uploaded attachment, positioned within a recipe.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PictureRef {
    pub id: i64,
    pub name: String,
    pub sort_number: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecipe {
    pub name: String,
    pub description: String,
    pub serves: Option<i32>,
    pub method: Option<String>,
    pub sources: Vec<String>,
    pub tags: Vec<i64>,
    pub category_id: i64,
    pub recipe_sections: Vec<RecipeSection>,
    pub associated_recipes: Vec<i64>,
    pub pictures: Vec<PictureRef>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Clone)]
pub struct CookbookClient {
    http: Client,
    cfg: Arc<ApiConfig>,
}

impl CookbookClient {
    pub fn new(cfg: ApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent("cookbook-migrate/0.1")
            .build()?;
        Ok(Self {
            http,
            cfg: Arc::new(cfg),
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, ApiError> {
        // Tolerate a base path configured without the trailing slash.
        let mut base = self.cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(url::Url::parse(&base)?.join(path)?)
    }

    /// POST a JSON body and decode the JSON response. Network errors and
    /// 5xx responses are retried with exponential backoff; 4xx responses
    /// surface immediately as `ApiError::Http`.
    async fn post_json<B, R>(
        &self,
        path: &str,
        cred: Option<&Credential>,
        body: &B,
    ) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut attempt: u32 = 0;
        loop {
            let mut req = self.http.post(url.clone()).json(body);
            if let Some(cred) = cred {
                req = req.header(header::AUTHORIZATION, format!("Bearer {}", cred.token()));
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        return Ok(serde_json::from_str(&text)?);
                    }
                    let body_text = resp.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < self.cfg.retry_attempts {
                        attempt += 1;
                        let delay = self.backoff_delay(attempt);
                        warn!(%url, status = status.as_u16(), attempt, "server error; retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ApiError::Http {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                Err(err) if attempt < self.cfg.retry_attempts => {
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(%url, error = %err, attempt, "request failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(ApiError::Net(err)),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 1u64 << attempt.min(6);
        Duration::from_millis(self.cfg.retry_base_delay_ms.saturating_mul(exp))
    }

    /// Authenticate and return a session credential. Works both for the
    /// operator login and for per-record impersonation.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential, ApiError> {
        let body = serde_json::json!({ "username": username, "password": password });
        match self
            .post_json::<_, TokenResponse>("auth/login", None, &body)
            .await
        {
            Ok(resp) => {
                debug!(username, "authenticated");
                Ok(Credential::new(resp.token))
            }
            Err(ApiError::Http { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                Err(ApiError::Auth {
                    username: username.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create_user(
        &self,
        cred: &Credential,
        user: &CreateUser,
    ) -> Result<i64, ApiError> {
        let created: Created = self.post_json("users", Some(cred), user).await?;
        Ok(created.id)
    }

    pub async fn create_category(&self, cred: &Credential, name: &str) -> Result<i64, ApiError> {
        let created: Created = self
            .post_json("categories", Some(cred), &serde_json::json!({ "name": name }))
            .await?;
        Ok(created.id)
    }

    pub async fn create_unit_category(
        &self,
        cred: &Credential,
        name: &str,
    ) -> Result<i64, ApiError> {
        let created: Created = self
            .post_json(
                "unit-categories",
                Some(cred),
                &serde_json::json!({ "name": name }),
            )
            .await?;
        Ok(created.id)
    }

    pub async fn create_unit(&self, cred: &Credential, unit: &CreateUnit) -> Result<i64, ApiError> {
        let created: Created = self.post_json("units", Some(cred), unit).await?;
        Ok(created.id)
    }

    pub async fn create_tag(&self, cred: &Credential, name: &str) -> Result<i64, ApiError> {
        let created: Created = self
            .post_json("tags", Some(cred), &serde_json::json!({ "name": name }))
            .await?;
        Ok(created.id)
    }

    /// Upload a binary attachment as multipart form data. The form cannot be
    /// reused across attempts, so the retry loop rebuilds it from the owned
    /// payload each time.
    pub async fn upload_picture(
        &self,
        cred: &Credential,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<i64, ApiError> {
        let url = self.endpoint("pictures")?;
        let mut attempt: u32 = 0;
        loop {
            let part = multipart::Part::bytes(data.clone())
                .file_name(filename.to_string())
                .mime_str("image/jpeg")?;
            let form = multipart::Form::new().part("file", part);
            let req = self
                .http
                .post(url.clone())
                .header(header::AUTHORIZATION, format!("Bearer {}", cred.token()))
                .multipart(form);
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let created: Created = serde_json::from_str(&resp.text().await?)?;
                        return Ok(created.id);
                    }
                    let body_text = resp.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < self.cfg.retry_attempts {
                        attempt += 1;
                        warn!(%url, status = status.as_u16(), attempt, "upload failed; retrying");
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(ApiError::Http {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                Err(err) if attempt < self.cfg.retry_attempts => {
                    attempt += 1;
                    warn!(%url, error = %err, attempt, "upload request failed; retrying");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                Err(err) => return Err(ApiError::Net(err)),
            }
        }
    }

    pub async fn create_recipe(
        &self,
        cred: &Credential,
        recipe: &CreateRecipe,
    ) -> Result<i64, ApiError> {
        let created: Created = self.post_json("recipes", Some(cred), recipe).await?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_uppercase() {
        assert_eq!(serde_json::to_string(&Role::Creator).unwrap(), "\"CREATOR\"");
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"ADMIN\"");
    }

    #[test]
    fn unit_payload_uses_camel_case() {
        let unit = CreateUnit {
            abbreviation: "g".into(),
            name: "gram".into(),
            unit_category_id: 20,
            required: true,
        };
        let v = serde_json::to_value(&unit).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "abbreviation": "g",
                "name": "gram",
                "unitCategoryId": 20,
                "required": true
            })
        );
    }

    #[test]
    fn recipe_payload_uses_camel_case_keys() {
        let recipe = CreateRecipe {
            name: "Bread".into(),
            description: "Plain loaf".into(),
            serves: Some(4),
            method: None,
            sources: vec!["https://example.com".into()],
            tags: vec![3],
            category_id: 7,
            recipe_sections: vec![RecipeSection {
                name: None,
                method: Some("Mix".into()),
                sort_number: 1,
                ingredients: vec![RecipeIngredient {
                    name: Some("Flour".into()),
                    value: Some(500.0),
                    sort_number: 1,
                    unit_id: 11,
                }],
            }],
            associated_recipes: vec![9],
            pictures: vec![PictureRef {
                id: 5,
                name: "loaf".into(),
                sort_number: 1,
            }],
        };
        let v = serde_json::to_value(&recipe).unwrap();
        assert_eq!(v["categoryId"], 7);
        assert_eq!(v["recipeSections"][0]["sortNumber"], 1);
        assert_eq!(v["recipeSections"][0]["ingredients"][0]["unitId"], 11);
        assert_eq!(v["associatedRecipes"][0], 9);
        assert_eq!(v["pictures"][0]["sortNumber"], 1);
    }

    #[test]
    fn user_payload_debug_hides_password() {
        let user = CreateUser {
            username: "alice".into(),
            first_name: None,
            last_name: None,
            password: "SecretPassword123".into(),
            roles: vec![Role::Creator],
        };
        let printed = format!("{user:?}");
        assert!(!printed.contains("SecretPassword123"));
        assert!(printed.contains("alice"));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("super-secret");
        let printed = format!("{cred:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("***"));
    }
}
