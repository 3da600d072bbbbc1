//! Cookie helpers and the mtop request signature.
//!
//! Every REST call to the h5 gateway is signed with
//! `md5(short_token & t & app_key & data)`, where the short token is the part
//! of the `_m_h5_tk` cookie before its first `_`.

use md5::{Digest, Md5};
use std::collections::BTreeMap;

/// Cookie that carries the signing token.
pub const TOKEN_COOKIE: &str = "_m_h5_tk";
/// Companion cookie refreshed together with [`TOKEN_COOKIE`].
pub const TOKEN_ENC_COOKIE: &str = "_m_h5_tk_enc";
/// Cookie holding the numeric user id of the logged-in account.
pub const USER_ID_COOKIE: &str = "unb";

/// Fixed mtop query parameters shared by every signed call.
pub const MTOP_JSV: &str = "2.7.2";
pub const MTOP_VERSION: &str = "1.0";

/// Hex MD5 signature over `short_token&timestamp&app_key&data`.
pub fn sign(short_token: &str, timestamp_ms: i64, app_key: &str, data: &str) -> String {
    let payload = format!("{short_token}&{timestamp_ms}&{app_key}&{data}");
    hex::encode(Md5::digest(payload.as_bytes()))
}

/// Parse a `Cookie` header value into name → value pairs.
pub fn parse_cookies(cookie: &str) -> BTreeMap<String, String> {
    cookie
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Render name → value pairs back into a `Cookie` header value.
pub fn render_cookies(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Signing token: `_m_h5_tk` value up to its first `_`.
pub fn short_token(cookie: &str) -> Option<String> {
    let cookies = parse_cookies(cookie);
    let tick = cookies.get(TOKEN_COOKIE)?;
    let token = tick.split('_').next().unwrap_or_default();
    (!token.is_empty()).then(|| token.to_string())
}

/// Numeric user id from the `unb` cookie.
pub fn user_id(cookie: &str) -> Option<String> {
    parse_cookies(cookie)
        .remove(USER_ID_COOKIE)
        .filter(|id| !id.is_empty())
}

/// Merge `Set-Cookie` header values into an existing cookie string.
///
/// Only the `name=value` part of each header is used; attributes such as
/// `Path` and `Expires` are dropped. Returns `None` when nothing changed.
pub fn merge_set_cookies<'a>(
    cookie: &str,
    set_cookies: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let mut cookies = parse_cookies(cookie);
    let mut changed = false;
    for header in set_cookies {
        let Some(first) = header.split(';').next() else {
            continue;
        };
        let Some((name, value)) = first.split_once('=') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() {
            continue;
        }
        if cookies.get(name).map(String::as_str) != Some(value) {
            cookies.insert(name.to_string(), value.to_string());
            changed = true;
        }
    }
    changed.then(|| render_cookies(&cookies))
}

/// A signed call against the mtop h5 gateway.
#[derive(Debug, Clone)]
pub struct MtopRequest {
    pub api: String,
    pub version: String,
    pub data: String,
    pub extra: Vec<(String, String)>,
}

impl MtopRequest {
    pub fn new(api: impl Into<String>, data: &serde_json::Value) -> Self {
        Self {
            api: api.into(),
            version: MTOP_VERSION.to_string(),
            data: data.to_string(),
            extra: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// `<base>/<api>/<version>/`
    pub fn url(&self, api_base: &str) -> String {
        format!(
            "{}/{}/{}/",
            api_base.trim_end_matches('/'),
            self.api,
            self.version
        )
    }

    /// Query string parameters, signature included.
    pub fn query(&self, app_key: &str, short_token: &str, timestamp_ms: i64) -> Vec<(String, String)> {
        let signature = sign(short_token, timestamp_ms, app_key, &self.data);
        let mut params: Vec<(String, String)> = vec![
            ("jsv".into(), MTOP_JSV.into()),
            ("appKey".into(), app_key.into()),
            ("t".into(), timestamp_ms.to_string()),
            ("sign".into(), signature),
            ("v".into(), self.version.clone()),
            ("type".into(), "originaljson".into()),
            ("accountSite".into(), "xianyu".into()),
            ("dataType".into(), "json".into()),
            ("timeout".into(), "20000".into()),
            ("api".into(), self.api.clone()),
            ("sessionOption".into(), "AutoLoginOnly".into()),
        ];
        params.extend(self.extra.iter().cloned());
        params
    }

    /// Form body: `data=<urlencoded json>`.
    pub fn form_body(&self) -> String {
        format!("data={}", urlencoding::encode(&self.data))
    }
}

/// `ret` entries of an mtop response, e.g. `["SUCCESS::调用成功"]`.
pub fn ret_codes(body: &serde_json::Value) -> Vec<String> {
    body.get("ret")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn ret_contains(body: &serde_json::Value, needle: &str) -> bool {
    ret_codes(body).iter().any(|code| code.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOKIE: &str = "cna=abc; unb=2201; _m_h5_tk=5f1e0c9ab2_1717000000000; _m_h5_tk_enc=zz";

    #[test]
    fn sign_is_md5_of_joined_fields() {
        // md5("tok&1&key&{}")
        let expected = hex::encode(Md5::digest(b"tok&1&key&{}"));
        assert_eq!(sign("tok", 1, "key", "{}"), expected);
        assert_eq!(sign("tok", 1, "key", "{}").len(), 32);
        assert_ne!(sign("tok", 2, "key", "{}"), expected);
    }

    #[test]
    fn short_token_is_tick_prefix() {
        assert_eq!(short_token(COOKIE).as_deref(), Some("5f1e0c9ab2"));
        assert_eq!(short_token("unb=1"), None);
        assert_eq!(short_token("_m_h5_tk=_123"), None);
    }

    #[test]
    fn user_id_reads_unb() {
        assert_eq!(user_id(COOKIE).as_deref(), Some("2201"));
        assert_eq!(user_id("a=b"), None);
    }

    #[test]
    fn merge_set_cookies_replaces_token_pair() {
        let merged = merge_set_cookies(
            COOKIE,
            [
                "_m_h5_tk=ffff_1717999999999; Path=/; Domain=.goofish.com",
                "_m_h5_tk_enc=yy; Path=/",
            ],
        )
        .unwrap();
        assert_eq!(short_token(&merged).as_deref(), Some("ffff"));
        assert!(merged.contains("_m_h5_tk_enc=yy"));
        assert!(merged.contains("unb=2201"));
        assert!(merge_set_cookies(COOKIE, ["unb=2201; Path=/"]).is_none());
    }

    #[test]
    fn mtop_request_builds_signed_query_and_form() {
        let req = MtopRequest::new(
            "mtop.taobao.idlemessage.pc.login.token",
            &serde_json::json!({"deviceId": "D-1"}),
        )
        .with_param("spm_cnt", "a21ybx.im.0.0");
        assert_eq!(
            req.url("https://h5api.m.goofish.com/h5/"),
            "https://h5api.m.goofish.com/h5/mtop.taobao.idlemessage.pc.login.token/1.0/"
        );
        let query = req.query("34839810", "tok", 42);
        let get = |k: &str| query.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("appKey").as_deref(), Some("34839810"));
        assert_eq!(get("t").as_deref(), Some("42"));
        assert_eq!(get("sign"), Some(sign("tok", 42, "34839810", &req.data)));
        assert_eq!(get("spm_cnt").as_deref(), Some("a21ybx.im.0.0"));
        assert_eq!(req.form_body(), "data=%7B%22deviceId%22%3A%22D-1%22%7D");
    }

    #[test]
    fn ret_helpers_scan_status_list() {
        let body = serde_json::json!({"ret": ["FAIL_SYS_USER_VALIDATE", "RGV587_ERROR::SM"]});
        assert!(ret_contains(&body, "FAIL_SYS_USER_VALIDATE"));
        assert!(!ret_contains(&body, "SUCCESS"));
        assert!(ret_codes(&serde_json::json!({})).is_empty());
    }
}
