//! Signed calls against the mtop h5 gateway.

use crate::config::TokenConfig;
use crate::protocol::sign::{self, MtopRequest};
use anyhow::{Context, Result};
use reqwest::header::{CONTENT_TYPE, COOKIE, ORIGIN, REFERER, SET_COOKIE, USER_AGENT};
use serde_json::Value;
use std::time::Duration;

/// Raw answer of one mtop call.
#[derive(Debug, Clone)]
pub struct MtopResponse {
    pub status: reqwest::StatusCode,
    pub body: Value,
    /// `Set-Cookie` header values, attributes included.
    pub set_cookies: Vec<String>,
}

impl MtopResponse {
    pub fn succeeded(&self) -> bool {
        sign::ret_contains(&self.body, "SUCCESS")
    }

    pub fn ret_summary(&self) -> String {
        let codes = sign::ret_codes(&self.body);
        if codes.is_empty() {
            format!("http {}", self.status)
        } else {
            codes.join(", ")
        }
    }
}

#[derive(Debug, Clone)]
pub struct MtopClient {
    http: reqwest::Client,
    api_base: String,
    app_key: String,
    user_agent: String,
    origin: String,
}

impl MtopClient {
    pub fn new(config: &TokenConfig, user_agent: &str, origin: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build mtop HTTP client")?;
        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            app_key: config.app_key.clone(),
            user_agent: user_agent.to_string(),
            origin: origin.to_string(),
        })
    }

    /// POST `request` signed with the short token of `cookie`. A cookie
    /// without `_m_h5_tk` is signed with an empty token; the gateway answers
    /// with fresh token cookies in that case.
    pub async fn call(&self, request: &MtopRequest, cookie: &str, now_ms: i64) -> Result<MtopResponse> {
        let short_token = sign::short_token(cookie).unwrap_or_default();
        let response = self
            .http
            .post(request.url(&self.api_base))
            .query(&request.query(&self.app_key, &short_token, now_ms))
            .header(COOKIE, cookie)
            .header(USER_AGENT, &self.user_agent)
            .header(ORIGIN, &self.origin)
            .header(REFERER, format!("{}/", self.origin.trim_end_matches('/')))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.form_body())
            .send()
            .await
            .with_context(|| format!("mtop call {} failed", request.api))?;

        let status = response.status();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let text = response
            .text()
            .await
            .with_context(|| format!("mtop call {} returned no body", request.api))?;
        let body: Value = serde_json::from_str(&text).with_context(|| {
            format!(
                "mtop call {} returned non-JSON (http {status}): {}",
                request.api,
                crate::util::truncate_with_ellipsis(&text, 120)
            )
        })?;

        Ok(MtopResponse {
            status,
            body,
            set_cookies,
        })
    }
}
