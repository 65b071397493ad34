//! Strategy selection: a total function over the crisis flag and the
//! classification. Precedence, highest first: crisis, direct, tools,
//! complex/low-confidence, standard.

use serde::{Deserialize, Serialize};

use super::classifier::{Classification, Complexity, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Crisis,
    Direct,
    Tool,
    Complex,
    Standard,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Crisis => "crisis",
            Strategy::Direct => "direct",
            Strategy::Tool => "tool",
            Strategy::Complex => "complex",
            Strategy::Standard => "standard",
        }
    }
}

/// Pick the strategy for a turn. `crisis` is the deterministic matcher's
/// verdict and dominates everything the model said.
pub fn route(crisis: bool, c: &Classification) -> Strategy {
    if crisis || c.intent == Intent::Crisis {
        return Strategy::Crisis;
    }

    if c.direct_answer && c.confidence >= 0.8 && !c.needs_tools {
        return Strategy::Direct;
    }

    if c.needs_tools {
        return Strategy::Tool;
    }

    if c.complexity == Complexity::Complex || c.confidence < 0.7 {
        return Strategy::Complex;
    }

    Strategy::Standard
}
