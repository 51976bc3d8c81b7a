//! Hand-off routing for Switchboard.
//!
//! Handles:
//! - Destination detection in agent replies ("deriving to agent-2")
//! - Summary extraction for the receiving agent
//! - Removal of routing artifacts from user-visible text

use regex::Regex;

use crate::config::Settings;

/// Routing signal found in an agent reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Explicit hand-off to a known agent.
    Agent(String),
    /// Hand-off verb without a resolvable target.
    Ambiguous,
}

impl RouteDecision {
    pub fn as_str(&self) -> &str {
        match self {
            RouteDecision::Agent(id) => id,
            RouteDecision::Ambiguous => "ambiguous",
        }
    }
}

/// Classifies agent replies into routing decisions.
pub struct Router {
    /// Hand-off pattern per agent, in priority order.
    handoffs: Vec<(String, Regex)>,
    verb: Regex,
    handoff_line: Regex,
    status_line: Regex,
    summary_marker: Option<Regex>,
    default_continuation: String,
}

impl Router {
    /// Build a router for agents in priority order.
    pub fn new(agent_ids: &[String], summary_marker: &str, default_continuation: &str) -> Self {
        let handoffs = agent_ids
            .iter()
            .filter_map(|id| {
                let pattern = format!(r"(?i)\bderiv(?:e|ing)\s+to\s+{}\b", regex::escape(id));
                match Regex::new(&pattern) {
                    Ok(re) => Some((id.clone(), re)),
                    Err(e) => {
                        tracing::warn!("Skipping agent id {} in router: {}", id, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            handoffs,
            verb: Regex::new(r"(?i)\bderiv(?:e|ing)\b").expect("static regex"),
            handoff_line: Regex::new(r"(?im)^[ \t]*deriv(?:e|ing)\s+to\s+[^\n]*$")
                .expect("static regex"),
            status_line: Regex::new(r"(?m)\[Sending[^\n]*$").expect("static regex"),
            summary_marker: (!summary_marker.is_empty())
                .then(|| Regex::new(&format!("(?i){}", regex::escape(summary_marker))))
                .and_then(|re| re.ok()),
            default_continuation: default_continuation.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut ids = settings.agent_ids();
        // Lowest-numbered id wins when several hand-offs match.
        ids.sort_by(|a, b| agent_rank(a).cmp(&agent_rank(b)).then_with(|| a.cmp(b)));
        Self::new(
            &ids,
            &settings.routing.summary_marker,
            &settings.routing.default_continuation,
        )
    }

    /// Find the routing signal in a reply, if any.
    pub fn classify(&self, reply: &str) -> Option<RouteDecision> {
        for (id, re) in &self.handoffs {
            if re.is_match(reply) {
                return Some(RouteDecision::Agent(id.clone()));
            }
        }
        if self.verb.is_match(reply) {
            return Some(RouteDecision::Ambiguous);
        }
        None
    }

    fn summary_start(&self, reply: &str) -> Option<usize> {
        self.summary_marker
            .as_ref()
            .and_then(|re| re.find(reply))
            .map(|m| m.start())
    }

    /// Summary handed to the receiving agent: everything from the marker on.
    pub fn extract_summary(&self, reply: &str) -> String {
        match self.summary_start(reply) {
            Some(idx) => reply[idx..].trim().to_string(),
            _ => self.default_continuation.clone(),
        }
    }

    /// The part of a routing reply meant for the user.
    pub fn strip_routing_artifacts(&self, reply: &str) -> String {
        let without_summary = match self.summary_start(reply) {
            Some(idx) => &reply[..idx],
            _ => reply,
        };
        let text = self.handoff_line.replace_all(without_summary, "");
        let text = self.status_line.replace_all(&text, "");

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Sort key for agent ids: the trailing number, if any.
fn agent_rank(id: &str) -> u64 {
    let digits: String = id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::from_settings(&Settings::default())
    }

    #[test]
    fn test_classify() {
        let r = router();
        assert_eq!(
            r.classify("Perfect, deriving to agent-2"),
            Some(RouteDecision::Agent("agent-2".to_string()))
        );
        assert_eq!(
            r.classify("I will DERIVE TO AGENT-3 now"),
            Some(RouteDecision::Agent("agent-3".to_string()))
        );
        assert_eq!(r.classify("deriving to someone"), Some(RouteDecision::Ambiguous));
        assert_eq!(r.classify("Welcome! How can I help?"), None);
        // "derivative" is not the hand-off verb
        assert_eq!(r.classify("a derivative contract"), None);
    }

    #[test]
    fn test_lowest_agent_wins() {
        let r = router();
        assert_eq!(
            r.classify("deriving to agent-3, or maybe derive to agent-2"),
            Some(RouteDecision::Agent("agent-2".to_string()))
        );
    }

    #[test]
    fn test_roster_order_by_number() {
        let mut settings = Settings::default();
        settings.agents.reverse();
        let r = Router::from_settings(&settings);
        assert_eq!(
            r.classify("derive to agent-1 and derive to agent-3"),
            Some(RouteDecision::Agent("agent-1".to_string()))
        );
    }

    #[test]
    fn test_agent_ten_does_not_match_agent_one() {
        let mut settings = Settings::default();
        settings.agents.push(crate::config::AgentConfig::new("agent-10"));
        let r = Router::from_settings(&settings);
        assert_eq!(
            r.classify("deriving to agent-10"),
            Some(RouteDecision::Agent("agent-10".to_string()))
        );
    }

    #[test]
    fn test_extract_summary() {
        let r = router();
        let reply = "deriving to agent-2\nGET_SUMMARY: interested in product X";
        assert_eq!(r.extract_summary(reply), "GET_SUMMARY: interested in product X");
        assert_eq!(
            r.extract_summary("deriving to agent-2"),
            "Please continue the conversation with the user."
        );
    }

    #[test]
    fn test_strip_routing_artifacts() {
        let r = router();
        let reply = "Thanks for your patience.\nDeriving to agent-2.\n[Sending details...]\n\nGET_SUMMARY: name: Ana";
        assert_eq!(r.strip_routing_artifacts(reply), "Thanks for your patience.");

        let reply = "deriving to agent-2\nGET_SUMMARY: interested in product X";
        assert_eq!(r.strip_routing_artifacts(reply), "");

        assert_eq!(r.strip_routing_artifacts("Bienvenido"), "Bienvenido");
    }
}
