//! Static model and role catalogs. Tiers form a strict order; downgrade
//! selection always picks the highest permitted tier.

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_ROLE: &str = "business";

#[derive(Debug, Clone, Copy)]
pub struct ModelDef {
    pub id: &'static str,
    pub display_name: &'static str,
    pub tier: u8,
    /// USD per million input tokens.
    pub input_cost_per_million: f64,
    /// USD per million output tokens.
    pub output_cost_per_million: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RoleDef {
    pub name: &'static str,
    pub permitted_models: &'static [&'static str],
    pub max_tokens_per_request: Option<u32>,
    /// Monthly token budget; None means unlimited.
    pub monthly_token_budget: Option<i64>,
}

pub const MODELS: &[ModelDef] = &[
    ModelDef {
        id: "claude-opus-4-20250514",
        display_name: "Claude Opus 4",
        tier: 4,
        input_cost_per_million: 15.0,
        output_cost_per_million: 75.0,
    },
    ModelDef {
        id: "claude-sonnet-4-20250514",
        display_name: "Claude Sonnet 4",
        tier: 3,
        input_cost_per_million: 3.0,
        output_cost_per_million: 15.0,
    },
    ModelDef {
        id: "claude-3-5-haiku-20241022",
        display_name: "Claude Haiku 3.5",
        tier: 1,
        input_cost_per_million: 0.8,
        output_cost_per_million: 4.0,
    },
];

pub const ROLES: &[RoleDef] = &[
    RoleDef {
        name: "admin",
        permitted_models: &[
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            "claude-3-5-haiku-20241022",
        ],
        max_tokens_per_request: None,
        monthly_token_budget: None,
    },
    RoleDef {
        name: "engineer",
        permitted_models: &[
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            "claude-3-5-haiku-20241022",
        ],
        max_tokens_per_request: Some(32_000),
        monthly_token_budget: Some(5_000_000),
    },
    RoleDef {
        name: "power_user",
        permitted_models: &["claude-sonnet-4-20250514", "claude-3-5-haiku-20241022"],
        max_tokens_per_request: Some(16_000),
        monthly_token_budget: Some(1_000_000),
    },
    RoleDef {
        name: "business",
        permitted_models: &["claude-sonnet-4-20250514", "claude-3-5-haiku-20241022"],
        max_tokens_per_request: Some(8_192),
        monthly_token_budget: Some(200_000),
    },
];

pub fn model_def(id: &str) -> Option<&'static ModelDef> {
    MODELS.iter().find(|m| m.id == id)
}

/// Role lookup; unknown names fall back to the default role.
pub fn role_def(name: &str) -> &'static RoleDef {
    ROLES
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| role_def(DEFAULT_ROLE))
}

pub fn is_known_role(name: &str) -> bool {
    ROLES.iter().any(|r| r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_strictly_ordered() {
        let mut tiers: Vec<u8> = MODELS.iter().map(|m| m.tier).collect();
        let len = tiers.len();
        tiers.sort_unstable();
        tiers.dedup();
        assert_eq!(tiers.len(), len);
    }

    #[test]
    fn unknown_role_falls_back_to_business() {
        assert_eq!(role_def("intern").name, "business");
        assert_eq!(role_def("engineer").name, "engineer");
    }

    #[test]
    fn every_permitted_model_exists_in_catalog() {
        for role in ROLES {
            for id in role.permitted_models {
                assert!(model_def(id).is_some(), "{} grants unknown model {}", role.name, id);
            }
        }
    }

    #[test]
    fn default_model_is_permitted_for_default_role() {
        assert!(role_def(DEFAULT_ROLE)
            .permitted_models
            .contains(&DEFAULT_MODEL));
    }
}
