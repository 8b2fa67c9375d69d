//! Vendor GPU name -> canonical catalog slug.
//!
//! Rules are evaluated in order against a cleaned-up form of the vendor
//! string; the first matching rule wins, so more specific variants (NVL, SXM,
//! PCIe, memory size) must be listed before their bare family name.

use once_cell::sync::Lazy;
use regex::Regex;

struct SlugRule {
    pattern: Regex,
    slug: &'static str,
}

const VENDOR_NOISE: &[&str] = &[
    "nvidia", "tesla", "geforce", "amd", "instinct", "radeon", "gpu", "tensor", "core", "datacenter",
];

static RULES: Lazy<Vec<SlugRule>> = Lazy::new(|| {
    [
        (r"\bgh\s*200\b", "gh200"),
        (r"\bb\s*200\b", "b200"),
        (r"\bh\s*200\b", "h200"),
        (r"\bh\s*100\s*nvl\b", "h100-nvl"),
        (r"\bh\s*100\s*pcie\d?\b", "h100-pcie"),
        (r"\bh\s*100\b.*\bpcie\d?\b", "h100-pcie"),
        (r"\bh\s*100\b.*\bnvl\b", "h100-nvl"),
        (r"\bh\s*100(\s*sxm\d?)?\b", "h100-sxm"),
        (r"\ba\s*100\b.*\b40\s*gb?\b", "a100-40gb"),
        (r"\ba\s*100(\s*(sxm|pcie)\d?)?\b", "a100-80gb"),
        (r"\bl\s*40\s*s\b", "l40s"),
        (r"\bl\s*40\b", "l40"),
        (r"\bl\s*4\b", "l4"),
        (r"\ba\s*10\s*g\b", "a10g"),
        (r"\ba\s*10\b", "a10"),
        (r"\ba\s*40\b", "a40"),
        (r"\b(rtx\s*)?6000\s*ada\b", "rtx-6000-ada"),
        (r"\b(rtx\s*)?a\s*6000\b", "rtx-a6000"),
        (r"\b(rtx\s*)?a\s*5000\b", "rtx-a5000"),
        (r"\b(rtx\s*)?a\s*4000\b", "rtx-a4000"),
        (r"\b(rtx\s*)?5090\b", "rtx-5090"),
        (r"\b(rtx\s*)?4090\b", "rtx-4090"),
        (r"\b(rtx\s*)?3090\b", "rtx-3090"),
        (r"\bv\s*100\b", "v100"),
        (r"\bt\s*4\b", "t4"),
        (r"\bmi\s*300\s*x\b", "mi300x"),
        (r"\bmi\s*250(\s*x)?\b", "mi250"),
    ]
    .into_iter()
    .map(|(pattern, slug)| SlugRule {
        pattern: Regex::new(pattern).expect("static gpu slug rule compiles"),
        slug,
    })
    .collect()
});

fn clean_vendor_name(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| !VENDOR_NOISE.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a free-text vendor GPU name to its catalog slug, or `None` when no rule matches.
pub fn normalize_gpu_slug(raw: &str) -> Option<&'static str> {
    let cleaned = clean_vendor_name(raw);
    if cleaned.is_empty() {
        return None;
    }
    RULES
        .iter()
        .find(|rule| rule.pattern.is_match(&cleaned))
        .map(|rule| rule.slug)
}

/// Every slug the normalizer can emit, in rule order without repeats.
pub fn known_gpu_slugs() -> Vec<&'static str> {
    let mut slugs: Vec<&'static str> = Vec::new();
    for rule in RULES.iter() {
        if !slugs.contains(&rule.slug) {
            slugs.push(rule.slug);
        }
    }
    slugs
}
