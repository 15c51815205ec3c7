use serde::{Deserialize, Serialize};

/// An agent persona bound to a system prompt and the tools it may request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Routing keywords matched against task title and objective.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub verifier: bool,
}
