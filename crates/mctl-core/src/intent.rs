//! Keyword scoring used to annotate prompts and logs. Never gates behavior.

use serde::Serialize;

const DOMAINS: &[(&str, &[&str])] = &[
    (
        "research",
        &["research", "investigate", "compare", "survey", "sources", "evidence", "analyze"],
    ),
    (
        "engineering",
        &["bug", "deploy", "api", "code", "build", "refactor", "latency", "outage"],
    ),
    (
        "finance",
        &["budget", "revenue", "cost", "invoice", "forecast", "pricing", "margin"],
    ),
    (
        "marketing",
        &["campaign", "launch", "audience", "brand", "copy", "seo", "newsletter"],
    ),
    (
        "operations",
        &["schedule", "vendor", "incident", "process", "logistics", "hiring", "onboarding"],
    ),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentClass {
    pub domain: &'static str,
    pub score: usize,
    pub matched: Vec<&'static str>,
}

pub fn classify_intent(title: &str, objective: &str) -> IntentClass {
    let text = format!("{title} {objective}").to_ascii_lowercase();
    let words = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();

    let mut best = IntentClass {
        domain: "general",
        score: 0,
        matched: Vec::new(),
    };
    for &(domain, keywords) in DOMAINS {
        let matched = keywords
            .iter()
            .copied()
            .filter(|kw| words.contains(kw))
            .collect::<Vec<_>>();
        if matched.len() > best.score {
            best = IntentClass {
                domain,
                score: matched.len(),
                matched,
            };
        }
    }
    best
}
