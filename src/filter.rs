//! Listing authenticity and economics filter.
//!
//! Stages run in order and the first failure wins:
//! 1. structured specs (stone type, creation method) carrying a simulant or lab marker
//! 2. simulant / imitation terms in the title, never overridable
//! 3. lab-created terms in the title, skipped when the task allows lab stones
//! 4. task exclude keywords, price bounds and minimum margin
//!
//! Everything here is pure: the same inputs always yield the same decision.

use crate::config::EconomicsConfig;
use crate::models::{ItemSpecs, TaskFilters};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const SIMULANT_TERMS: &[&str] = &[
    "cubic zirconia",
    "zirconia",
    "cz",
    "moissanite",
    "moissonite",
    "simulant",
    "simulated",
    "imitation",
    "faux",
    "glass",
    "doublet",
    "triplet",
    "composite",
    "rhinestone",
    "diamonique",
    "replica",
    "fake",
    "yag",
    "ggg",
];

const LAB_CREATED_TERMS: &[&str] = &[
    "lab created",
    "lab-created",
    "lab grown",
    "lab-grown",
    "lab made",
    "laboratory",
    "synthetic",
    "man made",
    "man-made",
    "cvd",
    "hpht",
    "created diamond",
    "created sapphire",
    "created ruby",
    "created emerald",
    "created opal",
];

/// Item specifics consulted by the specs stage.
const SPEC_FIELDS: &[&str] = &[
    "stone type",
    "main stone",
    "main stone type",
    "secondary stone",
    "gemstone",
    "gemstone type",
    "creation method",
    "main stone creation",
    "gemstone creation",
    "diamond creation",
];

const WEIGHT_FIELDS: &[&str] = &["metal weight", "item weight", "total weight", "weight"];
const PURITY_FIELDS: &[&str] = &["metal purity", "metal", "material", "base metal"];

const GRAMS_PER_TROY_OUNCE: f64 = 31.103_476_8;
const GRAMS_PER_PENNYWEIGHT: f64 = 1.555_173_84;
const GRAMS_PER_OUNCE: f64 = 28.349_523_125;

static SIMULANT_MATCHERS: Lazy<Vec<TermMatcher>> = Lazy::new(|| compile_terms(SIMULANT_TERMS));
static LAB_MATCHERS: Lazy<Vec<TermMatcher>> = Lazy::new(|| compile_terms(LAB_CREATED_TERMS));

static KARAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(8|9|10|14|18|22|24)\s?(?:k|kt|karat)\b").expect("valid karat regex")
});
static SILVER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b925\b|sterling").expect("valid silver regex"));
static PLATINUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:pt\s?)?950\b|platinum").expect("valid platinum regex"));
static WEIGHT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s?(grams|gram|gr|g|dwt|ozt|troy oz|oz)\b")
        .expect("valid weight regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    SpecsSimulant,
    SpecsLabCreated,
    Simulant,
    LabCreated,
    ExcludedKeyword,
    Price,
    Margin,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::SpecsSimulant => "specs_simulant",
            FilterStage::SpecsLabCreated => "specs_lab_created",
            FilterStage::Simulant => "simulant",
            FilterStage::LabCreated => "lab_created",
            FilterStage::ExcludedKeyword => "excluded_keyword",
            FilterStage::Price => "price",
            FilterStage::Margin => "margin",
        }
    }

    /// Rejections that hold for every task regardless of its configuration.
    pub fn is_universal(&self) -> bool {
        matches!(self, FilterStage::SpecsSimulant | FilterStage::Simulant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Economics {
    pub melt_value: f64,
    pub margin: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub accepted: bool,
    pub reason: Option<String>,
    pub stage: Option<FilterStage>,
    pub economics: Option<Economics>,
}

impl FilterDecision {
    fn accept(economics: Option<Economics>) -> Self {
        Self {
            accepted: true,
            reason: None,
            stage: None,
            economics,
        }
    }

    fn reject(stage: FilterStage, reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            stage: Some(stage),
            economics: None,
        }
    }

    pub fn is_universal_rejection(&self) -> bool {
        self.stage.is_some_and(|stage| stage.is_universal())
    }
}

#[derive(Debug, Clone)]
struct TermMatcher {
    term: String,
    word: Option<Regex>,
}

impl TermMatcher {
    fn new(term: &str) -> Option<Self> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return None;
        }
        // short terms like "cz" only count as whole words
        let word = if term.chars().count() <= 3 {
            Some(Regex::new(&format!(r"\b{}\b", regex::escape(&term))).ok()?)
        } else {
            None
        };
        Some(Self { term, word })
    }

    fn matches(&self, haystack: &str) -> bool {
        match &self.word {
            Some(re) => re.is_match(haystack),
            None => haystack.contains(&self.term),
        }
    }
}

fn compile_terms<S: AsRef<str>>(terms: &[S]) -> Vec<TermMatcher> {
    terms
        .iter()
        .filter_map(|term| TermMatcher::new(term.as_ref()))
        .collect()
}

fn first_match<'a>(matchers: &'a [TermMatcher], haystack: &str) -> Option<&'a str> {
    matchers
        .iter()
        .find(|m| m.matches(haystack))
        .map(|m| m.term.as_str())
}

#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    economics: EconomicsConfig,
}

impl FilterPipeline {
    pub fn new(economics: EconomicsConfig) -> Self {
        Self { economics }
    }

    /// Full decision for a detail-fetched listing.
    pub fn evaluate(
        &self,
        title: &str,
        specs: &ItemSpecs,
        price: Option<f64>,
        filters: &TaskFilters,
    ) -> FilterDecision {
        let title = title.to_lowercase();
        if let Some(rejection) = check_specs(specs, filters) {
            return rejection;
        }
        if let Some(rejection) = check_title(&title, filters) {
            return rejection;
        }
        if let Some(price) = price {
            if let Some(rejection) = check_price(price, filters) {
                return rejection;
            }
            let economics = self.estimate(&title, specs, price);
            if let (Some(min_margin), Some(econ)) = (filters.min_margin, economics)
                && econ.margin < min_margin
            {
                return FilterDecision::reject(
                    FilterStage::Margin,
                    format!("margin {:.2} below minimum {:.2}", econ.margin, min_margin),
                );
            }
            return FilterDecision::accept(economics);
        }
        FilterDecision::accept(None)
    }

    /// Cheap check on a search summary before spending a detail call.
    /// Skips the specs and margin stages, which need detail fields.
    pub fn prescreen(&self, title: &str, price: f64, filters: &TaskFilters) -> FilterDecision {
        let title = title.to_lowercase();
        check_title(&title, filters)
            .or_else(|| check_price(price, filters))
            .unwrap_or_else(|| FilterDecision::accept(None))
    }

    /// Melt value and margin when both metal purity and weight are known.
    pub fn estimate(&self, title_lower: &str, specs: &ItemSpecs, price: f64) -> Option<Economics> {
        let (spot, purity) = metal_purity(specs, title_lower, &self.economics)?;
        let grams = weight_grams(specs, title_lower)?;
        let melt_value = grams * purity * spot / GRAMS_PER_TROY_OUNCE;
        let margin = melt_value - price - self.economics.shipping_cost - price * self.economics.fee_rate;
        Some(Economics {
            melt_value: round_cents(melt_value),
            margin: round_cents(margin),
        })
    }
}

fn check_specs(specs: &ItemSpecs, filters: &TaskFilters) -> Option<FilterDecision> {
    for field in SPEC_FIELDS {
        let Some(value) = specs.get(*field) else {
            continue;
        };
        let lowered = value.to_lowercase();
        if let Some(term) = first_match(&SIMULANT_MATCHERS, &lowered) {
            return Some(FilterDecision::reject(
                FilterStage::SpecsSimulant,
                format!("specs: {field} \"{value}\" contains simulant marker \"{term}\""),
            ));
        }
        if !filters.allow_lab_created
            && let Some(term) = first_match(&LAB_MATCHERS, &lowered)
        {
            return Some(FilterDecision::reject(
                FilterStage::SpecsLabCreated,
                format!("specs: {field} \"{value}\" contains lab-created marker \"{term}\""),
            ));
        }
    }
    None
}

fn check_title(title_lower: &str, filters: &TaskFilters) -> Option<FilterDecision> {
    if let Some(term) = first_match(&SIMULANT_MATCHERS, title_lower) {
        return Some(FilterDecision::reject(
            FilterStage::Simulant,
            format!("blacklisted term \"{term}\" in title"),
        ));
    }
    if !filters.allow_lab_created
        && let Some(term) = first_match(&LAB_MATCHERS, title_lower)
    {
        return Some(FilterDecision::reject(
            FilterStage::LabCreated,
            format!("lab-created term \"{term}\" in title"),
        ));
    }
    if !filters.exclude_keywords.is_empty() {
        let custom = compile_terms(&filters.exclude_keywords);
        if let Some(term) = first_match(&custom, title_lower) {
            return Some(FilterDecision::reject(
                FilterStage::ExcludedKeyword,
                format!("excluded keyword \"{term}\" in title"),
            ));
        }
    }
    None
}

fn check_price(price: f64, filters: &TaskFilters) -> Option<FilterDecision> {
    if let Some(min) = filters.min_price
        && price < min
    {
        return Some(FilterDecision::reject(
            FilterStage::Price,
            format!("price {price:.2} below minimum {min:.2}"),
        ));
    }
    if let Some(max) = filters.max_price
        && price > max
    {
        return Some(FilterDecision::reject(
            FilterStage::Price,
            format!("price {price:.2} above maximum {max:.2}"),
        ));
    }
    None
}

fn metal_purity(
    specs: &ItemSpecs,
    title_lower: &str,
    cfg: &EconomicsConfig,
) -> Option<(f64, f64)> {
    let from_specs = PURITY_FIELDS
        .iter()
        .filter_map(|field| specs.get(*field))
        .find_map(|value| purity_from_text(&value.to_lowercase(), cfg));
    from_specs.or_else(|| purity_from_text(title_lower, cfg))
}

fn purity_from_text(text: &str, cfg: &EconomicsConfig) -> Option<(f64, f64)> {
    if let Some(caps) = KARAT_RE.captures(text) {
        let karat: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some((cfg.gold_spot_usd, karat / 24.0));
    }
    if PLATINUM_RE.is_match(text) {
        return Some((cfg.platinum_spot_usd, 0.95));
    }
    if SILVER_RE.is_match(text) {
        return Some((cfg.silver_spot_usd, 0.925));
    }
    None
}

fn weight_grams(specs: &ItemSpecs, title_lower: &str) -> Option<f64> {
    WEIGHT_FIELDS
        .iter()
        .filter_map(|field| specs.get(*field))
        .find_map(|value| parse_weight_grams(&value.to_lowercase()))
        .or_else(|| parse_weight_grams(title_lower))
}

/// Parses the first `<number> <unit>` weight in `text` into grams.
pub fn parse_weight_grams(text: &str) -> Option<f64> {
    let caps = WEIGHT_RE.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    let factor = match caps.get(2)?.as_str() {
        "g" | "gr" | "gram" | "grams" => 1.0,
        "dwt" => GRAMS_PER_PENNYWEIGHT,
        "ozt" | "troy oz" => GRAMS_PER_TROY_OUNCE,
        "oz" => GRAMS_PER_OUNCE,
        _ => return None,
    };
    Some(value * factor)
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
