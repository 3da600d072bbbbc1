use super::{Pipeline, PipelineOutcome};
use crate::codec::DecryptedMessage;
use crate::store::{AutoReplyRule, MatchType, ReplyRecord, WILDCARD_GOODS_ID};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

/// Compiled reply patterns keyed by their source. A pattern is compiled the
/// first time a rule using it is evaluated; invalid ones are remembered as
/// such and warned about once.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl PatternCache {
    pub fn get(&self, pattern: &str) -> Option<Regex> {
        let mut compiled = self.compiled.lock();
        if let Some(entry) = compiled.get(pattern) {
            return entry.clone();
        }
        let entry = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Reply: skipping invalid pattern {pattern:?}: {e}");
                None
            }
        };
        compiled.insert(pattern.to_string(), entry.clone());
        entry
    }

    /// Patterns compiled (or rejected) so far.
    pub fn len(&self) -> usize {
        self.compiled.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.lock().is_empty()
    }
}

/// First rule (in stored order) matching `text`.
///
/// Rules with an empty keyword never match. Regex rules that fail to compile
/// are skipped.
pub fn match_rule<'a>(
    rules: &'a [AutoReplyRule],
    text: &str,
    patterns: &PatternCache,
) -> Option<&'a AutoReplyRule> {
    rules.iter().find(|rule| rule_matches(rule, text, patterns))
}

fn rule_matches(rule: &AutoReplyRule, text: &str, patterns: &PatternCache) -> bool {
    if rule.keyword.is_empty() {
        return false;
    }
    match rule.match_type {
        MatchType::Contains => text.contains(&rule.keyword),
        MatchType::Exact => text == rule.keyword,
        MatchType::Regex => patterns
            .get(&rule.keyword)
            .is_some_and(|re| re.is_match(text)),
    }
}

impl Pipeline {
    pub(crate) async fn reply(&self, account_id: &str, message: &DecryptedMessage) -> PipelineOutcome {
        let goods_id = message
            .xy_goods_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(WILDCARD_GOODS_ID);
        let rules = match self.goods.auto_reply_config(account_id, goods_id).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("Reply[{account_id}]: rule lookup failed: {e:#}");
                return PipelineOutcome::NoMatch;
            }
        };
        let Some(rule) = match_rule(&rules, &message.msg_content, &self.patterns) else {
            tracing::debug!("Reply[{account_id}]: no rule matches {}", message.pnm_id);
            return PipelineOutcome::NoMatch;
        };

        self.timing.before_send(&rule.reply).await;
        let success = self
            .sender
            .send_text(
                account_id,
                &message.conversation_id(),
                &message.sender_user_id,
                &rule.reply,
            )
            .await;
        if success {
            tracing::info!(
                "Reply[{account_id}]: answered {:?} from {}",
                rule.keyword,
                message.sender_user_id
            );
        } else {
            tracing::warn!("Reply[{account_id}]: send failed for {}", message.pnm_id);
        }

        let record = ReplyRecord {
            account_id: account_id.to_string(),
            xy_goods_id: message.xy_goods_id.clone(),
            buyer_user_id: message.sender_user_id.clone(),
            message: message.msg_content.clone(),
            matched_keyword: rule.keyword.clone(),
            reply: rule.reply.clone(),
            success,
        };
        if let Err(e) = self.replies.record_reply(&record).await {
            tracing::error!("Reply[{account_id}]: failed to record outcome: {e:#}");
        }
        PipelineOutcome::Replied { success }
    }
}
