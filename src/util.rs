//! Utility functions for `xyrelay`.
//!
//! Small helpers shared by the session, codec and automation layers.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Chat content is mostly CJK, so truncation works on character boundaries
/// instead of byte indices. Used to keep frame and message previews in logs short.
///
/// # Examples
/// ```ignore
/// use xyrelay::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("感谢购买，马上安排发货", 4), "感谢购买...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Extract a query parameter from a URL-ish string (`...?a=1&b=2`).
///
/// The marketplace embeds goods and order ids in reminder links that are not
/// always well-formed URLs, so this only looks at the text after the first `?`.
pub fn query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key && !v.is_empty() {
            Some(
                urlencoding::decode(v)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_else(|_| v.to_string()),
            )
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii_with_truncation() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_cjk_characters() {
        let s = "感谢购买，马上安排发货";
        assert_eq!(truncate_with_ellipsis(s, 4), "感谢购买...");
        assert_eq!(truncate_with_ellipsis(s, 50), s);
    }

    #[test]
    fn test_truncate_zero_max_chars() {
        assert_eq!(truncate_with_ellipsis("hello", 0), "...");
    }

    #[test]
    fn query_param_reads_item_and_order_ids() {
        let url = "fleamarket://message_chat?itemId=7712&orderId=3301&sid=55#frag";
        assert_eq!(query_param(url, "itemId").as_deref(), Some("7712"));
        assert_eq!(query_param(url, "orderId").as_deref(), Some("3301"));
        assert_eq!(query_param(url, "sid").as_deref(), Some("55"));
        assert_eq!(query_param(url, "missing"), None);
    }

    #[test]
    fn query_param_handles_no_query_and_empty_values() {
        assert_eq!(query_param("https://example.com/path", "itemId"), None);
        assert_eq!(query_param("x?itemId=&orderId=9", "itemId"), None);
        assert_eq!(query_param("x?title=%E5%8F%91%E8%B4%A7", "title").as_deref(), Some("发货"));
    }

    #[test]
    fn unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
