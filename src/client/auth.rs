//! TradingView sign-in, including TOTP two-factor authentication

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::totp;
use crate::config::AuthConfig;
use crate::error::{Result, TvError};
use crate::utils::mask_sensitive_data;
use crate::validators::validate_credentials;

/// Token used for anonymous, delayed-data access
pub const UNAUTHORIZED_TOKEN: &str = "unauthorized_user_token";

#[derive(Debug, PartialEq)]
enum SignInOutcome {
    Token(String),
    TwoFactor,
}

/// Resolve an auth token: a configured token, a sign-in, or anonymous access
pub async fn authenticate(http: &Client, auth: &AuthConfig) -> Result<String> {
    if let Some(token) = &auth.auth_token {
        info!("Using provided auth token {}", mask_sensitive_data(token, 4));
        return Ok(token.clone());
    }

    validate_credentials(auth.username.as_deref(), auth.password.as_deref())?;
    let (Some(username), Some(password)) = (&auth.username, &auth.password) else {
        warn!("No credentials provided, data access may be limited");
        return Ok(UNAUTHORIZED_TOKEN.to_string());
    };

    debug!("Signing in as {}", username);
    let form = [
        ("username", username.as_str()),
        ("password", password.as_str()),
        ("remember", "on"),
    ];
    let body = post_form(http, &auth.sign_in_url, &auth.referer, &form).await?;

    let token = match interpret_sign_in(&body)? {
        SignInOutcome::Token(token) => token,
        SignInOutcome::TwoFactor => {
            info!("Two-factor authentication required");
            submit_two_factor(http, auth).await?
        }
    };

    info!("Authenticated as {}", username);
    debug!("Auth token: {}", mask_sensitive_data(&token, 4));
    Ok(token)
}

async fn submit_two_factor(http: &Client, auth: &AuthConfig) -> Result<String> {
    let code = match (&auth.totp_code, &auth.totp_secret) {
        (Some(code), _) => code.clone(),
        (None, Some(secret)) => totp::generate_totp(secret)?,
        (None, None) => {
            error!("2FA required but no code or TOTP secret available");
            return Err(TvError::TwoFactorRequired(
                "set TV_TOTP_SECRET or TV_2FA_CODE".to_string(),
            ));
        }
    };

    let form = [("code", code.as_str()), ("remember", "on")];
    let body = post_form(http, &auth.two_factor_url, &auth.referer, &form).await?;

    if let Some(message) = error_message(&body) {
        let lower = message.to_lowercase();
        if lower.contains("invalid") || lower.contains("incorrect") {
            return Err(TvError::Auth(format!("Invalid 2FA code: {}", message)));
        }
        return Err(TvError::Auth(format!("2FA verification failed: {}", message)));
    }
    extract_token(&body)
}

async fn post_form(http: &Client, url: &str, referer: &str, form: &[(&str, &str)]) -> Result<Value> {
    let response = http
        .post(url)
        .header(reqwest::header::REFERER, referer)
        .form(form)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                TvError::Timeout(format!("sign-in request: {}", e))
            } else {
                TvError::Http(e)
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TvError::Auth(format!("HTTP {}", status)));
    }
    Ok(response.json().await?)
}

fn error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

fn extract_token(body: &Value) -> Result<String> {
    body.pointer("/user/auth_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TvError::Auth("invalid response from server, no auth token".to_string()))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn interpret_sign_in(body: &Value) -> Result<SignInOutcome> {
    let code = body.get("code").and_then(Value::as_str).unwrap_or_default();
    if let Some(message) = error_message(body) {
        if code == "recaptcha_required" || message == "recaptcha_required" {
            return Err(TvError::Captcha);
        }
        error!("Authentication error: {} (code: {})", message, code);
        return Err(TvError::Auth(message));
    }

    if is_truthy(body.get("two_factor_required")) || is_truthy(body.get("2fa_required")) {
        return Ok(SignInOutcome::TwoFactor);
    }
    extract_token(body).map(SignInOutcome::Token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_in_token() {
        let body = json!({"error": "", "user": {"username": "alice", "auth_token": "tok_123"}});
        assert_eq!(
            interpret_sign_in(&body).unwrap(),
            SignInOutcome::Token("tok_123".to_string())
        );
    }

    #[test]
    fn test_sign_in_captcha() {
        let body = json!({"error": "Please confirm that you are not a robot", "code": "recaptcha_required"});
        assert!(matches!(interpret_sign_in(&body), Err(TvError::Captcha)));
    }

    #[test]
    fn test_sign_in_errors() {
        let body = json!({"error": "Invalid username or password"});
        let err = interpret_sign_in(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid username or password"));

        let body = json!({"user": {}});
        assert!(matches!(interpret_sign_in(&body), Err(TvError::Auth(_))));
    }

    #[test]
    fn test_sign_in_two_factor() {
        let body = json!({"error": "", "two_factor_required": true});
        assert_eq!(interpret_sign_in(&body).unwrap(), SignInOutcome::TwoFactor);
        let body = json!({"2fa_required": "totp"});
        assert_eq!(interpret_sign_in(&body).unwrap(), SignInOutcome::TwoFactor);
    }

    #[test]
    fn test_anonymous_and_provided_token() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let http = Client::new();

        let token = runtime
            .block_on(authenticate(&http, &AuthConfig::default()))
            .unwrap();
        assert_eq!(token, UNAUTHORIZED_TOKEN);

        let auth = AuthConfig {
            auth_token: Some("cached_token".to_string()),
            ..AuthConfig::default()
        };
        assert_eq!(runtime.block_on(authenticate(&http, &auth)).unwrap(), "cached_token");

        let auth = AuthConfig {
            username: Some("alice".to_string()),
            ..AuthConfig::default()
        };
        assert!(matches!(
            runtime.block_on(authenticate(&http, &auth)),
            Err(TvError::Validation { .. })
        ));
    }
}
