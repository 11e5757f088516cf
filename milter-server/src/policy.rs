use async_trait::async_trait;
use email_address_parser::EmailAddress;
use miette::Result;
use milter::{Judgement, Message, Policy, Session, Verdict};
use tracing::debug;

use crate::config::{CfgRule, RuleAction, RuleType};

/// Judges finalized messages against the configured envelope-domain rules.
///
/// Rules are evaluated in configuration order and the first match decides the
/// verdict; a message matching nothing is permitted.
pub struct DomainPolicy {
    rules: Vec<CfgRule>,
}

impl DomainPolicy {
    pub fn new(rules: Vec<CfgRule>) -> Self {
        DomainPolicy { rules }
    }

    fn judge(&self, message: &Message) -> Judgement {
        for rule in &self.rules {
            if !rule_matches(rule, message) {
                continue;
            }
            let reason = rule
                .reason
                .clone()
                .unwrap_or_else(|| "rejected by local policy".to_string());
            let verdict = match rule.action {
                RuleAction::Reject => Verdict::Reject,
                RuleAction::Tempfail => Verdict::TempFail,
            };
            return Judgement::new(verdict, reason);
        }
        Judgement::permit()
    }
}

#[async_trait]
impl Policy for DomainPolicy {
    async fn evaluate(&self, session: &Session, message: &Message) -> Result<Judgement> {
        let judgement = self.judge(message);
        debug!(
            session = session.id,
            verdict = judgement.verdict.as_str(),
            "policy evaluated"
        );
        Ok(judgement)
    }
}

fn rule_matches(rule: &CfgRule, message: &Message) -> bool {
    match rule.rule_type {
        RuleType::SenderDomain => address_domain(&message.from)
            .map_or(false, |domain| domain_listed(&rule.domain, &domain)),
        RuleType::RecipientDomain => message
            .rcpt
            .iter()
            .filter_map(|rcpt| address_domain(rcpt))
            .any(|domain| domain_listed(&rule.domain, &domain)),
    }
}

fn domain_listed(list: &[String], domain: &str) -> bool {
    list.iter().any(|entry| entry.eq_ignore_ascii_case(domain))
}

/// Domain part of an envelope address as the MTA delivers it, angle brackets
/// and all. The null sender (`<>`) has no domain.
fn address_domain(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    let parsed = EmailAddress::parse(trimmed, None)?;
    Some(parsed.get_domain().to_string())
}
