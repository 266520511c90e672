//! Keyword/phrase scoring of prompt text into business categories.
//!
//! The category lists are tunable data, not logic. Scoring: 3 points per
//! phrase present as a substring, 1 point per keyword present as a whole word
//! (keywords containing `&` are matched as substrings since normalization
//! keeps `&`). CLI traffic gets a +4 bias toward `code_generation`. Ties
//! resolve to the earliest category in `CATEGORIES` order.

use crate::audit::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    CodeGeneration,
    DocumentCreation,
    BusinessDevelopment,
    HumanResources,
    AccountingFinance,
    GeneralQa,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::DocumentCreation => "document_creation",
            Self::BusinessDevelopment => "business_development",
            Self::HumanResources => "human_resources",
            Self::AccountingFinance => "accounting_finance",
            Self::GeneralQa => "general_qa",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub category: Category,
    pub confidence: f64,
    pub secondary: Option<Category>,
}

struct CategoryDef {
    category: Category,
    keywords: &'static [&'static str],
    phrases: &'static [&'static str],
}

const CLI_CODE_BIAS: u32 = 4;
const PHRASE_WEIGHT: u32 = 3;

static CATEGORIES: &[CategoryDef] = &[
    CategoryDef {
        category: Category::CodeGeneration,
        keywords: &[
            "code", "function", "debug", "python", "javascript", "typescript", "rust", "java",
            "sql", "api", "regex", "compile", "refactor", "script", "algorithm", "bug",
            "exception", "repository", "git", "docker", "kubernetes", "terraform", "endpoint",
            "database", "schema", "json", "yaml", "frontend", "backend", "deploy", "cli",
        ],
        phrases: &[
            "write a function",
            "fix this bug",
            "code review",
            "unit test",
            "pull request",
            "stack trace",
            "error message",
            "shell command",
        ],
    },
    CategoryDef {
        category: Category::DocumentCreation,
        keywords: &[
            "document", "memo", "report", "draft", "summary", "outline", "proofread", "rewrite",
            "grammar", "formatting", "slide", "presentation", "newsletter", "blog", "letter",
            "template", "edit", "tone",
        ],
        phrases: &[
            "write a document",
            "executive summary",
            "meeting notes",
            "talking points",
            "cover letter",
            "press release",
            "bullet points",
        ],
    },
    CategoryDef {
        category: Category::BusinessDevelopment,
        keywords: &[
            "proposal", "rfp", "rfi", "rfq", "contract", "capture", "bid", "teaming",
            "subcontractor", "pricing", "sow", "naics", "gsa", "sam", "award", "solicitation",
            "incumbent", "recompete",
        ],
        phrases: &[
            "past performance",
            "statement of work",
            "request for proposal",
            "capture plan",
            "win themes",
            "government contract",
            "task order",
            "prime contractor",
        ],
    },
    CategoryDef {
        category: Category::HumanResources,
        keywords: &[
            "hiring", "onboarding", "offboarding", "recruiter", "recruiting", "interview",
            "candidate", "resume", "payroll", "benefits", "pto", "hr", "termination",
            "promotion", "compensation", "timesheet",
        ],
        phrases: &[
            "job description",
            "performance review",
            "offer letter",
            "employee handbook",
            "open enrollment",
            "background check",
        ],
    },
    CategoryDef {
        category: Category::AccountingFinance,
        keywords: &[
            "invoice", "accounting", "ledger", "payable", "receivable", "reconciliation",
            "budget", "forecast", "expense", "revenue", "quickbooks", "gaap", "depreciation",
            "margin", "p&l", "m&a",
        ],
        phrases: &[
            "balance sheet",
            "income statement",
            "cash flow",
            "journal entry",
            "profit and loss",
            "accounts payable",
            "accounts receivable",
        ],
    },
];

/// Lowercase and replace everything outside `[A-Za-z0-9_&\s]` with a space.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '&' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn score_category(def: &CategoryDef, normalized: &str, words: &[&str]) -> u32 {
    let mut score = 0;
    for phrase in def.phrases {
        if normalized.contains(phrase) {
            score += PHRASE_WEIGHT;
        }
    }
    for keyword in def.keywords {
        let hit = if keyword.contains('&') {
            normalized.contains(keyword)
        } else {
            words.contains(keyword)
        };
        if hit {
            score += 1;
        }
    }
    score
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn classify(text: &str, source: Source) -> Classification {
    let normalized = normalize(text);
    let words: Vec<&str> = normalized.split_whitespace().collect();

    let mut scores: Vec<(Category, u32)> = CATEGORIES
        .iter()
        .map(|def| (def.category, score_category(def, &normalized, &words)))
        .collect();

    if source == Source::Cli {
        for (category, score) in scores.iter_mut() {
            if *category == Category::CodeGeneration {
                *score += CLI_CODE_BIAS;
            }
        }
    }

    // Stable sort keeps the declared category order on ties.
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    let (top_category, top_score) = scores[0];
    if top_score == 0 {
        return Classification {
            category: Category::GeneralQa,
            confidence: 1.0,
            secondary: None,
        };
    }

    let second = scores.get(1).copied();
    let confidence = match second {
        Some((_, second_score)) if second_score > 0 => {
            round2(top_score as f64 / (top_score + second_score) as f64)
        }
        _ => 1.0,
    };
    let secondary = second.and_then(|(category, score)| (score > 0).then_some(category));

    Classification {
        category: top_category,
        confidence,
        secondary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_bias_wins_for_neutral_text() {
        let cli = classify("help me with this task", Source::Cli);
        assert_eq!(cli.category, Category::CodeGeneration);
        assert_eq!(cli.confidence, 1.0);
        assert!(cli.secondary.is_none());

        let web = classify("help me with this task", Source::Web);
        assert_eq!(web.category, Category::GeneralQa);
        assert_eq!(web.confidence, 1.0);
    }

    #[test]
    fn code_prompt_classifies_as_code_generation() {
        let result = classify(
            "please write a function in python to parse json from an api",
            Source::Web,
        );
        assert_eq!(result.category, Category::CodeGeneration);
    }

    #[test]
    fn proposal_prompt_classifies_as_business_development() {
        let result = classify(
            "draft win themes for the request for proposal, our bid against the incumbent",
            Source::Web,
        );
        assert_eq!(result.category, Category::BusinessDevelopment);
    }

    #[test]
    fn ampersand_keywords_match_as_substrings() {
        let result = classify("summarize the P&L for march", Source::Web);
        assert_eq!(result.category, Category::AccountingFinance);
    }

    #[test]
    fn confidence_reflects_top_two_scores() {
        // code_generation: "python" + "code" = 2; document_creation: "memo" = 1.
        let result = classify("turn this python code into a memo", Source::Web);
        assert_eq!(result.category, Category::CodeGeneration);
        assert_eq!(result.confidence, 0.67);
        assert_eq!(result.secondary, Some(Category::DocumentCreation));
    }

    #[test]
    fn tie_resolves_to_declared_category_order() {
        // One keyword each: "code" vs "memo".
        let result = classify("code memo", Source::Web);
        assert_eq!(result.category, Category::CodeGeneration);
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.secondary, Some(Category::DocumentCreation));
    }

    #[test]
    fn punctuation_is_normalized_to_spaces() {
        let result = classify("refactor(this)！ sql;query", Source::Web);
        assert_eq!(result.category, Category::CodeGeneration);
    }
}
